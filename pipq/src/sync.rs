//! Conditional Synchronization Primitives
//!
//! Every shared word in the queue (lock words, leader counters, announce
//! flags, `next` pointers of the leader set, epoch counters) is declared
//! through this module so the same code can run under Loom's model checker.
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test -p pipq --features loom --test loom_verification
//! ```
//!
//! Without `--cfg loom` everything here is a zero-cost re-export of `core`.

#[cfg(all(feature = "loom", loom))]
pub mod atomic {
    //! Loom atomics, tracked across every explored interleaving.

    pub use loom::sync::atomic::{
        fence, AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering,
    };
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod atomic {
    //! Standard library atomics.

    pub use core::sync::atomic::{
        fence, AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering,
    };
}

#[cfg(all(feature = "loom", loom))]
pub mod cell {
    //! Loom-aware cell types.
    //!
    //! Loom's `UnsafeCell` hands out tracked `ConstPtr`/`MutPtr` wrappers
    //! instead of raw pointers; the helpers below hide the difference.

    pub use loom::cell::UnsafeCell;

    /// Get a mutable raw pointer from an UnsafeCell.
    ///
    /// # Safety
    /// Caller must ensure exclusive access to the cell's contents.
    #[inline]
    pub unsafe fn get_mut_ptr<T>(cell: &UnsafeCell<T>) -> *mut T {
        cell.get_mut().deref()
    }

    /// Get a shared raw pointer from an UnsafeCell.
    ///
    /// # Safety
    /// Caller must ensure no concurrent writer exists.
    #[inline]
    pub unsafe fn get_ptr<T>(cell: &UnsafeCell<T>) -> *const T {
        cell.get().deref()
    }

    /// Access the contents of an UnsafeCell mutably through a closure.
    ///
    /// # Safety
    /// Caller must ensure exclusive access to the cell's contents.
    #[inline]
    pub unsafe fn with_mut<T, R>(cell: &UnsafeCell<T>, f: impl FnOnce(&mut T) -> R) -> R {
        cell.with_mut(|ptr| f(&mut *ptr))
    }
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod cell {
    //! Standard library cell types.

    pub use core::cell::UnsafeCell;

    /// Get a mutable raw pointer from an UnsafeCell.
    ///
    /// # Safety
    /// Caller must ensure exclusive access to the cell's contents.
    #[inline]
    pub unsafe fn get_mut_ptr<T>(cell: &UnsafeCell<T>) -> *mut T {
        cell.get()
    }

    /// Get a shared raw pointer from an UnsafeCell.
    ///
    /// # Safety
    /// Caller must ensure no concurrent writer exists.
    #[inline]
    pub unsafe fn get_ptr<T>(cell: &UnsafeCell<T>) -> *const T {
        cell.get()
    }

    /// Access the contents of an UnsafeCell mutably through a closure.
    ///
    /// # Safety
    /// Caller must ensure exclusive access to the cell's contents.
    #[inline]
    pub unsafe fn with_mut<T, R>(cell: &UnsafeCell<T>, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut *cell.get())
    }
}

pub mod hint {
    //! Busy-wait hint.
    //!
    //! Under Loom a spinning thread must yield, otherwise the model never
    //! schedules the thread it is waiting on.

    /// Signals that the caller is inside a spin loop.
    #[inline]
    pub fn spin_loop() {
        #[cfg(all(feature = "loom", loom))]
        loom::thread::yield_now();

        #[cfg(not(all(feature = "loom", loom)))]
        core::hint::spin_loop();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::atomic::{AtomicI64, AtomicUsize, Ordering};
    use super::cell::{with_mut, UnsafeCell};

    #[test]
    fn test_atomic_cas_even_odd() {
        let word = AtomicUsize::new(0);
        assert!(word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok());
        assert!(word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err());
        word.fetch_add(1, Ordering::Release);
        assert_eq!(word.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_signed_counter_goes_negative() {
        let counter = AtomicI64::new(0);
        counter.fetch_sub(1, Ordering::AcqRel);
        assert_eq!(counter.load(Ordering::Acquire), -1);
    }

    #[test]
    fn test_with_mut() {
        let cell = UnsafeCell::new(vec![1, 2]);
        unsafe { with_mut(&cell, |v| v.push(3)) };
        let len = unsafe { with_mut(&cell, |v| v.len()) };
        assert_eq!(len, 3);
    }
}
