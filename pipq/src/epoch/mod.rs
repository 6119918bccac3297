//! Epoch-Based Memory Reclamation for the Leader Set
//!
//! Leader-set nodes are unlinked by whichever thread wins the CAS that splices
//! them out, but other threads may still be walking through them: the Linden
//! delete-min runs over a prefix of logically deleted nodes, and a Harris
//! search may hold a pointer to a node that a concurrent insert just bypassed.
//! Freeing such a node immediately is a use-after-free. This module defers
//! the free until every thread that could have observed the node has left its
//! critical section.
//!
//! # Algorithm Overview
//!
//! ```text
//!   global epoch  e ──────────► e+1 ──────────► e+2
//!                 │                             │
//!   retire(node)  │ sealed with epoch e         │ bag freed: every pinned
//!                 ▼                             ▼ participant entered ≥ e+1
//!   participant ─ pin ─ traverse ─ unlink ─ unpin
//! ```
//!
//! Each thread context registers one [`Participant`] with the queue's
//! [`Collector`]. Pinning publishes the global epoch into the participant
//! slot; the epoch only advances once every pinned participant has observed
//! the current value. A bag of retired nodes sealed at epoch `e` is freed once
//! the global epoch reaches `e + 2`.
//!
//! # Safety Invariants
//!
//! 1. **Grace Period**: a node retired while the retiring thread is pinned
//!    is freed only after the global epoch has advanced twice since the bag
//!    holding it was sealed.
//! 2. **Single Retirement**: only the thread whose CAS unlinked a segment
//!    retires the nodes in it.
//! 3. **Owner-Only Local Bags**: a participant's local bag is touched only by
//!    the thread holding its [`LocalHandle`], or by `&mut Collector`.

mod atomic;
mod collector;
mod guard;

pub use atomic::Atomic;
pub use collector::{Collector, LocalHandle, Participant};
#[cfg(feature = "statistics")]
pub use collector::CollectorStatistics;
pub use guard::Guard;

use crate::sync::atomic::AtomicU64;
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;

/// Global epoch counter type
pub type Epoch = u64;

/// Atomic epoch for lock-free operations
pub type AtomicEpoch = AtomicU64;

/// The epoch value indicating an unpinned participant
pub const INACTIVE: Epoch = u64::MAX;

/// Returns the mask of pointer bits that are free for tagging in `*const T`.
#[inline]
pub(crate) const fn low_bits<T>() -> usize {
    (1 << mem::align_of::<T>().trailing_zeros()) - 1
}

/// An owned pointer to heap-allocated data
///
/// `Owned<T>` behaves like `Box<T>` until it is published into an [`Atomic`]
/// through [`Owned::into_shared`]; after that the memory belongs to the
/// shared structure and is released through [`Guard::defer_destroy`].
///
/// ```rust
/// use pipq::epoch::Owned;
///
/// let owned = Owned::new(42);
/// assert_eq!(*owned, 42);
/// ```
pub struct Owned<T> {
    data: NonNull<T>,
    _marker: PhantomData<Box<T>>,
}

impl<T> Owned<T> {
    /// Allocates `data` on the heap.
    #[inline]
    pub fn new(data: T) -> Self {
        Self::from_box(Box::new(data))
    }

    /// Creates a new `Owned<T>` from a `Box<T>`.
    #[inline]
    pub fn from_box(b: Box<T>) -> Self {
        let ptr = Box::into_raw(b);
        // SAFETY: Box::into_raw never returns null
        unsafe {
            Self {
                data: NonNull::new_unchecked(ptr),
                _marker: PhantomData,
            }
        }
    }

    /// Converts back into a `Box<T>`.
    #[inline]
    pub fn into_box(self) -> Box<T> {
        let ptr = self.data.as_ptr();
        mem::forget(self);
        // SAFETY: exclusive ownership, pointer came from Box
        unsafe { Box::from_raw(ptr) }
    }

    /// Gives up ownership, returning an untagged shared pointer bound to
    /// `guard`.
    #[inline]
    pub fn into_shared<'g>(self, _guard: &'g Guard<'_>) -> Shared<'g, T> {
        let ptr = self.data.as_ptr();
        mem::forget(self);
        // SAFETY: the pointer is valid and now owned by the shared structure
        unsafe { Shared::from_ptr(ptr) }
    }
}

impl<T> Deref for Owned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: exclusive ownership
        unsafe { self.data.as_ref() }
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        // SAFETY: exclusive ownership, pointer came from Box
        unsafe {
            drop(Box::from_raw(self.data.as_ptr()));
        }
    }
}

// SAFETY: Owned provides exclusive ownership, so Send/Sync follow T
unsafe impl<T: Send> Send for Owned<T> {}
unsafe impl<T: Sync> Sync for Owned<T> {}

/// A tagged pointer protected by an epoch guard
///
/// The low bits left free by `T`'s alignment carry a small tag. The leader
/// set stores its deleted/moving state there; this type only knows the
/// tag as a `usize`.
///
/// The pointee stays valid for `'g` because nothing retired while the guard
/// is pinned can be freed before the guard is dropped.
pub struct Shared<'g, T> {
    data: usize,
    _marker: PhantomData<(&'g (), *const T)>,
}

impl<'g, T> Shared<'g, T> {
    /// Creates a null, untagged pointer.
    #[inline]
    pub const fn null() -> Self {
        Self {
            data: 0,
            _marker: PhantomData,
        }
    }

    /// Creates an untagged shared pointer from a raw pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to memory that stays valid for `'g`.
    #[inline]
    pub unsafe fn from_ptr(ptr: *const T) -> Self {
        debug_assert_eq!(ptr as usize & low_bits::<T>(), 0, "unaligned pointer");
        Self::from_usize(ptr as usize)
    }

    #[inline]
    pub(crate) fn from_usize(data: usize) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn into_usize(self) -> usize {
        self.data
    }

    /// Returns `true` if the pointer part is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.as_raw().is_null()
    }

    /// Returns the untagged raw pointer.
    #[inline]
    pub fn as_raw(&self) -> *const T {
        (self.data & !low_bits::<T>()) as *const T
    }

    /// Returns the tag stored in the low bits.
    #[inline]
    pub fn tag(&self) -> usize {
        self.data & low_bits::<T>()
    }

    /// Returns the same pointer with its tag replaced.
    #[inline]
    pub fn with_tag(&self, tag: usize) -> Self {
        debug_assert_eq!(tag & !low_bits::<T>(), 0, "tag does not fit");
        Self::from_usize((self.data & !low_bits::<T>()) | (tag & low_bits::<T>()))
    }

    /// Dereferences the pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and must have been loaded while `'g`'s
    /// guard was pinned.
    #[inline]
    pub unsafe fn deref(&self) -> &'g T {
        debug_assert!(!self.is_null());
        unsafe { &*self.as_raw() }
    }

    /// Converts to `Option<&T>`, returning `None` if null.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Shared::deref`] when non-null.
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&'g T> {
        if self.is_null() {
            None
        } else {
            Some(unsafe { &*self.as_raw() })
        }
    }

    /// Takes back ownership of a pointer that was never published, or that
    /// is unreachable and not retired.
    ///
    /// # Safety
    ///
    /// No other thread may hold or obtain the pointer.
    #[inline]
    pub unsafe fn into_owned(self) -> Owned<T> {
        debug_assert!(!self.is_null());
        Owned {
            data: unsafe { NonNull::new_unchecked(self.as_raw() as *mut T) },
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Shared<'_, T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> PartialEq for Shared<'_, T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> core::fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shared")
            .field("raw", &self.as_raw())
            .field("tag", &self.tag())
            .finish()
    }
}

/// Deferred destruction function type
type DeferredFn = unsafe fn(*mut u8);

/// A batch of retired objects waiting for their grace period.
pub(crate) struct GarbageBag {
    deferred: Vec<Deferred>,
}

struct Deferred {
    data: *mut u8,
    destroy: DeferredFn,
}

// SAFETY: a deferred object is unreachable; only its destructor touches it
unsafe impl Send for Deferred {}

impl GarbageBag {
    pub(crate) fn new() -> Self {
        Self {
            deferred: Vec::new(),
        }
    }

    /// Queues `ptr` for destruction as a `Box<T>`.
    ///
    /// # Safety
    ///
    /// The pointer must come from `Box<T>` and be unreachable for new readers.
    pub(crate) unsafe fn defer<T>(&mut self, ptr: *mut T) {
        self.deferred.push(Deferred {
            data: ptr as *mut u8,
            destroy: destroy::<T>,
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.deferred.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deferred.is_empty()
    }

    /// Moves the contents out, leaving an empty bag.
    pub(crate) fn take(&mut self) -> GarbageBag {
        GarbageBag {
            deferred: mem::take(&mut self.deferred),
        }
    }

    /// Runs every deferred destructor.
    ///
    /// # Safety
    ///
    /// No thread may still hold a reference to any object in the bag.
    pub(crate) unsafe fn collect(&mut self) -> usize {
        let n = self.deferred.len();
        for deferred in self.deferred.drain(..) {
            unsafe { (deferred.destroy)(deferred.data) };
        }
        n
    }
}

impl Drop for GarbageBag {
    fn drop(&mut self) {
        // Bags are only dropped by their collector (with exclusive access) or
        // after their grace period.
        unsafe { self.collect() };
    }
}

unsafe fn destroy<T>(ptr: *mut u8) {
    unsafe {
        drop(Box::from_raw(ptr as *mut T));
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Aligned(u64);

    #[test]
    fn test_owned_into_box() {
        let owned = Owned::new(String::from("leader"));
        let boxed = owned.into_box();
        assert_eq!(*boxed, "leader");
    }

    #[test]
    fn test_shared_tag_roundtrip() {
        let owned = Owned::new(Aligned(7));
        let raw = owned.into_box();
        let ptr = Box::into_raw(raw);

        let shared = unsafe { Shared::from_ptr(ptr) };
        assert_eq!(shared.tag(), 0);

        let tagged = shared.with_tag(3);
        assert_eq!(tagged.tag(), 3);
        assert_eq!(tagged.as_raw(), ptr as *const Aligned);
        assert_eq!(unsafe { tagged.deref() }.0, 7);
        assert_ne!(tagged, shared);

        drop(unsafe { tagged.into_owned() });
    }

    #[test]
    fn test_low_bits() {
        assert_eq!(low_bits::<u8>(), 0);
        assert_eq!(low_bits::<u32>(), 3);
        assert_eq!(low_bits::<Aligned>(), 7);
    }

    #[test]
    fn test_garbage_bag_take_and_collect() {
        let mut bag = GarbageBag::new();
        unsafe {
            bag.defer(Box::into_raw(Box::new(1i64)));
            bag.defer(Box::into_raw(Box::new(String::from("x"))));
        }
        let mut sealed = bag.take();
        assert!(bag.is_empty());
        assert_eq!(sealed.len(), 2);
        assert_eq!(unsafe { sealed.collect() }, 2);
        assert!(sealed.is_empty());
    }
}
