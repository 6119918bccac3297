//! Even/Odd Spin Lock
//!
//! Every lock in the queue (worker heaps, zone compete locks, the global
//! coordinator lock) is a single counter word:
//!
//! ```text
//!   word:   0 ──acquire──► 1 ──release──► 2 ──acquire──► 3 ── ...
//!           even = free      odd = held
//! ```
//!
//! Acquire is a CAS from an even value `v` to `v + 1`; release is a plain
//! `fetch_add(1)`. Because the word never repeats, a waiter can tell that
//! *some* holder came and went by comparing against the value it first saw,
//! which is what the coordinator election relies on: a thread that lost the
//! race keeps calling a helper hook until the word moves, then re-checks
//! whether its own request was already served.
//!
//! The lock is not reentrant. Guards release on drop, so every exit path
//! releases.

use core::ops::{Deref, DerefMut};

use crossbeam_utils::CachePadded;

use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::cell::{get_mut_ptr, get_ptr, UnsafeCell};
use crate::sync::hint;

/// What a waiter's hook asks the lock to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spin {
    /// Keep waiting.
    Continue,
    /// Give up; `acquire_with` returns `None`.
    Abort,
}

/// A counter-word spin lock protecting a `T`.
pub struct EvenOddLock<T> {
    word: CachePadded<AtomicU64>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the lock word
unsafe impl<T: Send> Send for EvenOddLock<T> {}
unsafe impl<T: Send> Sync for EvenOddLock<T> {}

impl<T> EvenOddLock<T> {
    /// Creates an unlocked lock.
    pub fn new(data: T) -> Self {
        Self {
            word: CachePadded::new(AtomicU64::new(0)),
            data: UnsafeCell::new(data),
        }
    }

    /// Current counter value.
    #[inline]
    pub fn version(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Returns `true` while some thread holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.version() & 1 == 1
    }

    /// Single acquisition attempt.
    #[inline]
    pub fn try_acquire(&self) -> Option<EvenOddGuard<'_, T>> {
        let v = self.word.load(Ordering::Relaxed);
        if v & 1 == 1 {
            return None;
        }
        self.cas(v)
    }

    /// Spins until the lock is held.
    pub fn acquire(&self) -> EvenOddGuard<'_, T> {
        loop {
            if let Some(guard) = self.acquire_with(|| Spin::Continue) {
                return guard;
            }
        }
    }

    /// Spins until the lock is held, calling `help` on every iteration in
    /// which the word has not changed.
    ///
    /// Returns `None` as soon as `help` returns [`Spin::Abort`].
    pub fn acquire_with(&self, mut help: impl FnMut() -> Spin) -> Option<EvenOddGuard<'_, T>> {
        loop {
            let v = self.word.load(Ordering::Relaxed);
            if v & 1 == 0 {
                if let Some(guard) = self.cas(v) {
                    return Some(guard);
                }
                continue;
            }

            while self.word.load(Ordering::Relaxed) == v {
                if help() == Spin::Abort {
                    return None;
                }
                hint::spin_loop();
            }
        }
    }

    /// Exclusive access without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: &mut self rules out any guard
        unsafe { &mut *get_mut_ptr(&self.data) }
    }

    #[inline]
    fn cas(&self, v: u64) -> Option<EvenOddGuard<'_, T>> {
        self.word
            .compare_exchange(v, v + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| EvenOddGuard { lock: self })
    }
}

impl<T: Default> Default for EvenOddLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> core::fmt::Debug for EvenOddLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EvenOddLock")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

/// Holds an [`EvenOddLock`]; releases it on drop.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct EvenOddGuard<'a, T> {
    lock: &'a EvenOddLock<T>,
}

impl<T> Deref for EvenOddGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the lock is held
        unsafe { &*get_ptr(&self.lock.data) }
    }
}

impl<T> DerefMut for EvenOddGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held and this guard is unique
        unsafe { &mut *get_mut_ptr(&self.lock.data) }
    }
}

impl<T> Drop for EvenOddGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.word.fetch_add(1, Ordering::Release);
    }
}
