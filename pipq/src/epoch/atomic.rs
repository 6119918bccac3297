//! Tagged atomic pointer.
//!
//! `Atomic<T>` stores a pointer and a small tag in one `usize` word so that a
//! single CAS or `fetch_or` can update both. Loads are bound to a guard so
//! the returned [`Shared`] cannot outlive the pin that protects it.

use crate::sync::atomic::{AtomicUsize, Ordering};
use core::marker::PhantomData;

use super::{low_bits, Guard, Owned, Shared};

/// An atomic, optionally tagged pointer to `T`.
pub struct Atomic<T> {
    data: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: behaves like a shared reference to T across threads
unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Creates a null pointer.
    pub fn null() -> Self {
        Self {
            data: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Creates an atomic that takes ownership of `owned`.
    pub fn from_owned(owned: Owned<T>) -> Self {
        let raw = owned.into_box();
        Self {
            data: AtomicUsize::new(Box::into_raw(raw) as usize),
            _marker: PhantomData,
        }
    }

    /// Creates an atomic initialised with `shared`.
    pub fn from_shared(shared: Shared<'_, T>) -> Self {
        Self {
            data: AtomicUsize::new(shared.into_usize()),
            _marker: PhantomData,
        }
    }

    /// Loads the pointer and tag.
    #[inline]
    pub fn load<'g>(&self, ord: Ordering, _guard: &'g Guard<'_>) -> Shared<'g, T> {
        Shared::from_usize(self.data.load(ord))
    }

    /// Stores `new`.
    #[inline]
    pub fn store(&self, new: Shared<'_, T>, ord: Ordering) {
        self.data.store(new.into_usize(), ord);
    }

    /// Replaces the word if it equals `current` (pointer and tag).
    ///
    /// On failure the observed value is returned.
    #[inline]
    pub fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        success: Ordering,
        failure: Ordering,
        _guard: &'g Guard<'_>,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        self.data
            .compare_exchange(current.into_usize(), new.into_usize(), success, failure)
            .map(Shared::from_usize)
            .map_err(Shared::from_usize)
    }

    /// Sets tag bits, returning the previous value.
    #[inline]
    pub fn fetch_or<'g>(&self, tag: usize, ord: Ordering, _guard: &'g Guard<'_>) -> Shared<'g, T> {
        debug_assert_eq!(tag & !low_bits::<T>(), 0, "tag does not fit");
        Shared::from_usize(self.data.fetch_or(tag & low_bits::<T>(), ord))
    }

    /// Returns the untagged pointer without guard protection.
    ///
    /// Dereferencing it is only sound when nothing can free the pointee,
    /// e.g. with `&mut` access to the owning structure.
    #[inline]
    pub(crate) fn load_raw(&self, ord: Ordering) -> *mut T {
        (self.data.load(ord) & !low_bits::<T>()) as *mut T
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> core::fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let data = self.data.load(Ordering::Relaxed);
        f.debug_struct("Atomic")
            .field("raw", &((data & !low_bits::<T>()) as *const T))
            .field("tag", &(data & low_bits::<T>()))
            .finish()
    }
}
