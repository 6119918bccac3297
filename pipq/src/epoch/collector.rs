//! Epoch Collector Implementation
//!
//! The collector owns the global epoch, a fixed table of participant slots
//! (one per thread context the queue will ever hand out) and the list of
//! sealed garbage bags waiting for their grace period.
//!
//! # Algorithm
//!
//! ```text
//! 1. A thread context registers and receives a LocalHandle bound to one slot
//! 2. handle.pin() publishes the global epoch into the slot and returns a Guard
//! 3. Retired nodes go into the slot's local bag (owner-only, no locking)
//! 4. A full local bag is sealed with the current epoch and pushed to the
//!    shared sealed list
//! 5. The epoch advances once every pinned slot has observed it
//! 6. A sealed bag from epoch e is freed once the global epoch reaches e + 2
//! ```
//!
//! # Complexity
//!
//! - pin(): O(1)
//! - defer_destroy(): O(1) amortized
//! - try_advance(): O(T) where T is participant capacity
//! - collect(): O(B + G) where B is sealed bags and G is freed objects

use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::sync::cell::{get_mut_ptr, UnsafeCell};
use core::marker::PhantomData;
use parking_lot::Mutex;

#[cfg(feature = "statistics")]
use crate::sync::atomic::AtomicU64;

use super::{AtomicEpoch, Epoch, GarbageBag, Guard, INACTIVE};

/// Number of retired objects a local bag holds before it is sealed.
const SEAL_THRESHOLD: usize = 128;

/// A garbage bag tagged with the epoch it was sealed in.
struct SealedBag {
    epoch: Epoch,
    bag: GarbageBag,
}

/// The per-queue garbage collector
///
/// `Collector` has a fixed participant capacity chosen at construction. The
/// priority queue sizes it to its configured thread count, so registration
/// can only fail if more handles are requested than contexts exist.
///
/// # Example
///
/// ```rust
/// use pipq::epoch::Collector;
///
/// let collector = Collector::new(2);
/// let handle = collector.register().unwrap();
/// let guard = handle.pin();
/// assert!(guard.is_pinned());
/// ```
pub struct Collector {
    /// The global epoch counter
    pub(crate) global_epoch: AtomicEpoch,

    /// Participant slots, one per registered thread context
    participants: Box<[Participant]>,

    /// Sealed bags awaiting their grace period
    sealed: Mutex<Vec<SealedBag>>,

    /// Collection statistics
    #[cfg(feature = "statistics")]
    stats: CollectorStats,
}

/// Statistics for garbage collection (optional)
#[cfg(feature = "statistics")]
#[derive(Debug, Default)]
struct CollectorStats {
    retired: AtomicU64,
    reclaimed: AtomicU64,
    epoch_advances: AtomicU64,
    failed_advances: AtomicU64,
}

/// Snapshot of collector counters.
#[cfg(feature = "statistics")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStatistics {
    /// Objects handed to `defer_destroy`
    pub retired: u64,
    /// Objects whose destructor has run
    pub reclaimed: u64,
    /// Successful epoch advances
    pub epoch_advances: u64,
    /// Advances blocked by a lagging participant
    pub failed_advances: u64,
}

/// A participant slot in the epoch-based reclamation scheme
///
/// # Memory Layout
///
/// `#[repr(align(64))]` keeps each slot's epoch word on its own cache line;
/// every pin writes it and every advance attempt reads all of them.
#[repr(align(64))]
pub struct Participant {
    /// The epoch this participant last observed (INACTIVE if not pinned)
    pub(crate) epoch: AtomicEpoch,

    /// Whether a `LocalHandle` currently owns this slot
    registered: AtomicBool,

    /// Retired objects not yet sealed; touched only by the owning handle
    pub(crate) local_garbage: UnsafeCell<GarbageBag>,

    /// Nesting depth of live guards; touched only by the owning handle
    pub(crate) pin_count: AtomicUsize,
}

impl Participant {
    fn new() -> Self {
        Self {
            epoch: AtomicEpoch::new(INACTIVE),
            registered: AtomicBool::new(false),
            local_garbage: UnsafeCell::new(GarbageBag::new()),
            pin_count: AtomicUsize::new(0),
        }
    }
}

// SAFETY: shared state is atomic; the local bag is only reached through the
// single LocalHandle that owns the slot, or through &mut Collector
unsafe impl Send for Participant {}
unsafe impl Sync for Participant {}

/// Registration of one thread with a [`Collector`]
///
/// The handle is `!Send`: its participant slot's local bag and pin count are
/// accessed without synchronization.
pub struct LocalHandle<'c> {
    collector: &'c Collector,
    participant: &'c Participant,
    _marker: PhantomData<*mut ()>,
}

impl<'c> LocalHandle<'c> {
    /// Pins this participant, returning a guard that protects access.
    ///
    /// Nested pins are allowed; only the outermost publishes an epoch.
    ///
    /// The guard borrows the handle, so the handle cannot go away while the
    /// slot is pinned:
    ///
    /// ```compile_fail
    /// use pipq::epoch::Collector;
    ///
    /// let collector = Collector::new(1);
    /// let handle = collector.register().unwrap();
    /// let guard = handle.pin();
    /// drop(handle);
    /// drop(guard);
    /// ```
    #[inline]
    pub fn pin(&self) -> Guard<'_> {
        let p = self.participant;
        if p.pin_count.fetch_add(1, Ordering::Relaxed) == 0 {
            // SeqCst pairs with the loads in try_advance(): either the
            // advancer sees our epoch or we see the advanced one.
            let epoch = self.collector.global_epoch.load(Ordering::SeqCst);
            p.epoch.store(epoch, Ordering::SeqCst);
        }
        Guard::pinned(self.collector, p)
    }

    /// Returns the collector this handle is registered with.
    #[inline]
    pub fn collector(&self) -> &'c Collector {
        self.collector
    }
}

impl Drop for LocalHandle<'_> {
    fn drop(&mut self) {
        let p = self.participant;
        // SAFETY: this handle is the slot's only user
        let bag = unsafe { &mut *get_mut_ptr(&p.local_garbage) };
        if !bag.is_empty() {
            self.collector.seal(bag.take());
        }

        // A leaked guard keeps the slot pinned; it stays claimed so a new
        // handle never mistakes the stale count for a nested pin.
        let pins = p.pin_count.load(Ordering::Relaxed);
        debug_assert_eq!(pins, 0, "handle dropped while pinned");
        if pins != 0 {
            return;
        }
        p.epoch.store(INACTIVE, Ordering::SeqCst);
        p.registered.store(false, Ordering::Release);
    }
}

impl Collector {
    /// Creates a collector with room for `capacity` participants.
    pub fn new(capacity: usize) -> Self {
        Self {
            global_epoch: AtomicEpoch::new(0),
            participants: (0..capacity).map(|_| Participant::new()).collect(),
            sealed: Mutex::new(Vec::new()),
            #[cfg(feature = "statistics")]
            stats: CollectorStats::default(),
        }
    }

    /// Claims a free participant slot.
    ///
    /// Returns `None` when every slot is taken.
    pub fn register(&self) -> Option<LocalHandle<'_>> {
        let participant = self.participants.iter().find(|p| {
            p.registered
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })?;

        Some(LocalHandle {
            collector: self,
            participant,
            _marker: PhantomData,
        })
    }

    /// Returns a guard usable while no other thread touches the structure.
    ///
    /// Objects deferred through it are freed immediately.
    pub fn quiescent(&mut self) -> Guard<'_> {
        Guard::quiescent(self)
    }

    /// Number of participant slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.participants.len()
    }

    /// Returns the current global epoch.
    #[inline]
    pub fn epoch(&self) -> Epoch {
        self.global_epoch.load(Ordering::SeqCst)
    }

    /// Number of objects in sealed bags that have not been freed yet.
    pub fn sealed_garbage(&self) -> usize {
        self.sealed.lock().iter().map(|s| s.bag.len()).sum()
    }

    /// Attempts to advance the global epoch.
    ///
    /// The epoch can only advance if every pinned participant has observed
    /// the current epoch.
    pub fn try_advance(&self) -> bool {
        let current = self.global_epoch.load(Ordering::SeqCst);

        for participant in self.participants.iter() {
            let p_epoch = participant.epoch.load(Ordering::SeqCst);
            if p_epoch != INACTIVE && p_epoch != current {
                #[cfg(feature = "statistics")]
                self.stats.failed_advances.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let advanced = self
            .global_epoch
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        #[cfg(feature = "statistics")]
        if advanced {
            self.stats.epoch_advances.fetch_add(1, Ordering::Relaxed);
        }

        advanced
    }

    /// Tries to advance the epoch, then frees every sealed bag whose grace
    /// period has passed. Returns the number of objects freed.
    pub fn try_advance_and_collect(&self) -> usize {
        self.try_advance();
        let current = self.epoch();

        let ready: Vec<SealedBag> = {
            let mut sealed = self.sealed.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < sealed.len() {
                if sealed[i].epoch.wrapping_add(2) <= current {
                    ready.push(sealed.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            ready
        };

        // Destructors run outside the lock.
        let mut freed = 0;
        for mut sealed in ready {
            // SAFETY: two epoch advances since sealing; no participant pinned
            // at the time of retirement can still be pinned
            freed += unsafe { sealed.bag.collect() };
        }

        #[cfg(feature = "statistics")]
        self.stats
            .reclaimed
            .fetch_add(freed as u64, Ordering::Relaxed);

        freed
    }

    /// Seals `bag` with the current epoch.
    pub(crate) fn seal(&self, bag: GarbageBag) {
        let epoch = self.epoch();
        self.sealed.lock().push(SealedBag { epoch, bag });
    }

    /// Adds a retired object to `participant`'s local bag, sealing the bag
    /// once it is full.
    ///
    /// # Safety
    ///
    /// The caller must be the thread owning `participant`, and `ptr` must be
    /// a `Box` allocation unreachable for new readers.
    pub(crate) unsafe fn defer<T>(&self, participant: &Participant, ptr: *mut T) {
        // SAFETY: owner-only access, guaranteed by the caller
        let bag = unsafe { &mut *get_mut_ptr(&participant.local_garbage) };
        unsafe { bag.defer(ptr) };

        #[cfg(feature = "statistics")]
        self.stats.retired.fetch_add(1, Ordering::Relaxed);

        if bag.len() >= SEAL_THRESHOLD {
            self.seal(bag.take());
            self.try_advance_and_collect();
        }
    }

    /// Seals `participant`'s local bag if it holds anything.
    ///
    /// # Safety
    ///
    /// The caller must be the thread owning `participant`.
    pub(crate) unsafe fn flush(&self, participant: &Participant) {
        let bag = unsafe { &mut *get_mut_ptr(&participant.local_garbage) };
        if !bag.is_empty() {
            self.seal(bag.take());
        }
        self.try_advance_and_collect();
    }

    /// Frees an object immediately; only reachable through a quiescent guard.
    pub(crate) unsafe fn destroy_now<T>(&self, ptr: *mut T) {
        #[cfg(feature = "statistics")]
        {
            self.stats.retired.fetch_add(1, Ordering::Relaxed);
            self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { drop(Box::from_raw(ptr)) };
    }

    /// Frees every retired object regardless of epoch.
    pub fn collect_all(&mut self) -> usize {
        let mut freed = 0;
        for sealed in self.sealed.get_mut().iter_mut() {
            // SAFETY: &mut self, no guard can be alive
            freed += unsafe { sealed.bag.collect() };
        }
        self.sealed.get_mut().clear();

        for participant in self.participants.iter() {
            // SAFETY: &mut self, no handle can be alive
            let bag = unsafe { &mut *get_mut_ptr(&participant.local_garbage) };
            freed += unsafe { bag.collect() };
        }

        #[cfg(feature = "statistics")]
        self.stats
            .reclaimed
            .fetch_add(freed as u64, Ordering::Relaxed);

        freed
    }

    /// Returns collection statistics.
    #[cfg(feature = "statistics")]
    pub fn statistics(&self) -> CollectorStatistics {
        CollectorStatistics {
            retired: self.stats.retired.load(Ordering::Relaxed),
            reclaimed: self.stats.reclaimed.load(Ordering::Relaxed),
            epoch_advances: self.stats.epoch_advances.load(Ordering::Relaxed),
            failed_advances: self.stats.failed_advances.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.collect_all();
    }
}

impl core::fmt::Debug for Collector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collector")
            .field("epoch", &self.epoch())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    struct DropCounter(Arc<StdAtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_collector_new() {
        let collector = Collector::new(4);
        assert_eq!(collector.epoch(), 0);
        assert_eq!(collector.capacity(), 4);
    }

    #[test]
    fn test_register_until_full() {
        let collector = Collector::new(2);
        let a = collector.register();
        let b = collector.register();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(collector.register().is_none());

        drop(a);
        assert!(collector.register().is_some());
    }

    #[test]
    fn test_epoch_advance() {
        let collector = Collector::new(1);
        assert!(collector.try_advance());
        assert_eq!(collector.epoch(), 1);
    }

    #[test]
    fn test_guard_blocks_second_advance() {
        let collector = Collector::new(1);
        let handle = collector.register().unwrap();
        let guard = handle.pin();

        // Pinned at 0: one advance is allowed, the next must wait.
        assert!(collector.try_advance());
        assert!(!collector.try_advance());

        drop(guard);
        assert!(collector.try_advance());
    }

    #[test]
    fn test_nested_pin_keeps_outer_epoch() {
        let collector = Collector::new(1);
        let handle = collector.register().unwrap();

        let outer = handle.pin();
        assert!(collector.try_advance());
        let inner = handle.pin();
        assert_eq!(inner.epoch(), 0);
        drop(inner);
        assert!(!collector.try_advance());
        drop(outer);
    }

    #[test]
    fn test_deferred_freed_after_grace_period() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        let collector = Collector::new(1);
        let handle = collector.register().unwrap();

        {
            let guard = handle.pin();
            let ptr = Box::into_raw(Box::new(DropCounter(drops.clone())));
            unsafe { guard.defer_destroy(ptr) };
            guard.flush();
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 0);

        for _ in 0..3 {
            collector.try_advance_and_collect();
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(collector.sealed_garbage(), 0);
    }

    #[test]
    fn test_pinned_participant_delays_collection() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        let collector = Collector::new(2);
        let reader = collector.register().unwrap();
        let writer = collector.register().unwrap();

        let reader_guard = reader.pin();
        {
            let guard = writer.pin();
            let ptr = Box::into_raw(Box::new(DropCounter(drops.clone())));
            unsafe { guard.defer_destroy(ptr) };
            guard.flush();
        }

        for _ in 0..4 {
            collector.try_advance_and_collect();
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 0);

        drop(reader_guard);
        for _ in 0..3 {
            collector.try_advance_and_collect();
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quiescent_guard_frees_immediately() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        let mut collector = Collector::new(1);
        let guard = collector.quiescent();
        let ptr = Box::into_raw(Box::new(DropCounter(drops.clone())));
        unsafe { guard.defer_destroy(ptr) };
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_frees_everything() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        {
            let collector = Collector::new(1);
            let handle = collector.register().unwrap();
            let guard = handle.pin();
            for _ in 0..10 {
                let ptr = Box::into_raw(Box::new(DropCounter(drops.clone())));
                unsafe { guard.defer_destroy(ptr) };
            }
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 10);
    }

    #[test]
    fn test_reregistered_slot_publishes_epoch() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        let collector = Collector::new(2);

        let first = collector.register().unwrap();
        drop(first.pin());
        drop(first);

        assert!(collector.try_advance());
        let reader = collector.register().unwrap();
        let reader_guard = reader.pin();
        assert_eq!(reader_guard.epoch(), collector.epoch());
        assert_ne!(reader_guard.epoch(), INACTIVE);

        let writer = collector.register().unwrap();
        {
            let guard = writer.pin();
            let ptr = Box::into_raw(Box::new(DropCounter(drops.clone())));
            unsafe { guard.defer_destroy(ptr) };
            guard.flush();
        }
        for _ in 0..4 {
            collector.try_advance_and_collect();
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 0);

        drop(reader_guard);
        for _ in 0..3 {
            collector.try_advance_and_collect();
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_threads() {
        use std::thread;

        let collector = Collector::new(4);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let handle = collector.register().unwrap();
                    for i in 0..500u64 {
                        let guard = handle.pin();
                        let ptr = Box::into_raw(Box::new(i));
                        unsafe { guard.defer_destroy(ptr) };
                    }
                });
            }
        });

        assert!(collector.epoch() > 0);
    }
}
