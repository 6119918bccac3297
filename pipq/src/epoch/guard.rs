//! Epoch Guard Implementation
//!
//! Guards provide RAII-based epoch pinning. While a guard exists, nothing
//! retired after it was pinned can be freed.
//!
//! # Lifetime Safety
//!
//! The guard's lifetime bounds `Shared<'g, T>` pointers, ensuring that shared
//! references cannot outlive the protection window.
//!
//! # Quiescent Guards
//!
//! [`Collector::quiescent`] returns a guard with no participant behind it.
//! It can only be built from `&mut Collector`, so no other guard exists and
//! deferred objects are freed on the spot. Diagnostics and teardown use it.

use crate::sync::atomic::Ordering;
use core::marker::PhantomData;

use super::{Collector, Participant, INACTIVE};

/// A guard that pins the current participant in an epoch.
///
/// `Guard` is `!Send` and `!Sync`: it stands for one thread's pin.
pub struct Guard<'a> {
    collector: &'a Collector,

    /// `None` for quiescent guards
    participant: Option<&'a Participant>,

    _marker: PhantomData<*mut ()>,
}

impl<'a> Guard<'a> {
    #[inline]
    pub(crate) fn pinned(collector: &'a Collector, participant: &'a Participant) -> Self {
        Self {
            collector,
            participant: Some(participant),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn quiescent(collector: &'a mut Collector) -> Self {
        Self {
            collector,
            participant: None,
            _marker: PhantomData,
        }
    }

    /// Returns a reference to the collector.
    #[inline]
    pub fn collector(&self) -> &'a Collector {
        self.collector
    }

    /// Returns `true` unless this is a quiescent guard.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.participant.is_some()
    }

    /// Returns the epoch this guard published, or `INACTIVE` for a quiescent
    /// guard.
    #[inline]
    pub fn epoch(&self) -> super::Epoch {
        match self.participant {
            Some(p) => p.epoch.load(Ordering::SeqCst),
            None => INACTIVE,
        }
    }

    /// Defers destruction of a `Box`-allocated object until no pinned
    /// participant can still reach it.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box<T>`, must already be unreachable for threads
    /// that pin after this call, and must be retired exactly once.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pipq::epoch::Collector;
    ///
    /// let collector = Collector::new(1);
    /// let handle = collector.register().unwrap();
    /// let guard = handle.pin();
    ///
    /// let ptr = Box::into_raw(Box::new(42i64));
    /// unsafe { guard.defer_destroy(ptr) };
    /// ```
    #[inline]
    pub unsafe fn defer_destroy<T>(&self, ptr: *mut T) {
        match self.participant {
            // SAFETY: the guard is !Send, so this is the owning thread
            Some(p) => unsafe { self.collector.defer(p, ptr) },
            // SAFETY: quiescent guards imply exclusive access
            None => unsafe { self.collector.destroy_now(ptr) },
        }
    }

    /// Seals this participant's pending garbage and attempts a collection.
    pub fn flush(&self) {
        if let Some(p) = self.participant {
            // SAFETY: owning thread
            unsafe { self.collector.flush(p) };
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        if let Some(p) = self.participant {
            if p.pin_count.fetch_sub(1, Ordering::Relaxed) == 1 {
                p.epoch.store(INACTIVE, Ordering::SeqCst);
            }
        }
    }
}

impl core::fmt::Debug for Guard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Guard")
            .field("pinned", &self.is_pinned())
            .field("epoch", &self.epoch())
            .finish()
    }
}
