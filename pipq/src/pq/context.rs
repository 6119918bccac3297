//! Per-worker shared state and the per-thread context handle.

use crossbeam_utils::CachePadded;

use super::stats::WorkerStats;
use super::{Pipq, Value};
use crate::epoch::LocalHandle;
use crate::leader::{LeaderEntry, Owner};
use crate::lock::EvenOddLock;
use crate::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use crate::sync::cell::{get_mut_ptr, get_ptr, UnsafeCell};
use crate::worker::{HeapEntry, WorkerHeap};
use crate::Key;

/// A delete-min request slot.
///
/// The requesting thread publishes, the coordinator serves, and the
/// requester takes the result once the slot is no longer pending:
///
/// ```text
///   requester            coordinator
///   publish()  ──────►   is_pending() == true
///                        serve(result)
///   is_pending() == false ◄──┘
///   take()
/// ```
pub struct AnnounceSlot<V> {
    pending: CachePadded<AtomicBool>,
    result: UnsafeCell<Option<LeaderEntry<V>>>,
}

// SAFETY: `result` is written only by the single server before it clears
// `pending` (Release) and read only by the requester after observing it
// cleared (Acquire).
unsafe impl<V: Send> Send for AnnounceSlot<V> {}
unsafe impl<V: Send> Sync for AnnounceSlot<V> {}

impl<V: Copy> AnnounceSlot<V> {
    /// Creates an idle slot.
    pub fn new() -> Self {
        Self {
            pending: CachePadded::new(AtomicBool::new(false)),
            result: UnsafeCell::new(None),
        }
    }

    /// Marks a request as outstanding.
    #[inline]
    pub fn publish(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns `true` while the request has not been served.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Stores the result and completes the request.
    ///
    /// # Safety
    ///
    /// The caller must be the only thread serving this slot, and the slot
    /// must be pending.
    #[inline]
    pub unsafe fn serve(&self, result: Option<LeaderEntry<V>>) {
        unsafe { *get_mut_ptr(&self.result) = result };
        self.pending.store(false, Ordering::Release);
    }

    /// Reads the result of a completed request.
    ///
    /// # Safety
    ///
    /// The caller must be the requester and must have observed
    /// `is_pending() == false` after its last `publish`.
    #[inline]
    pub unsafe fn take(&self) -> Option<LeaderEntry<V>> {
        unsafe { *get_ptr(&self.result) }
    }
}

impl<V: Copy> Default for AnnounceSlot<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-protected part of a worker.
pub(crate) struct WorkerState<V: Copy> {
    pub(crate) heap: WorkerHeap<V>,
    /// Upper bound on this worker's live leader entries, `None` when it may
    /// have none.
    pub(crate) largest: Option<HeapEntry<V>>,
}

impl<V: Value> WorkerState<V> {
    #[inline]
    pub(crate) fn raise_largest(&mut self, entry: HeapEntry<V>) {
        self.largest = self.largest.max(Some(entry));
    }
}

/// One thread's slice of the queue, stored in its zone's node-local array.
pub(crate) struct Worker<V: Copy> {
    pub(crate) state: EvenOddLock<WorkerState<V>>,
    pub(crate) announce: AnnounceSlot<V>,
    /// Live leader entries owned by this worker
    pub(crate) leader_count: CachePadded<AtomicI64>,
    /// Keys dropped because an identical entry was already a leader
    pub(crate) repeat_keys: AtomicI64,
    pub(crate) stats: CachePadded<WorkerStats>,
    pub(crate) registered: AtomicBool,
}

impl<V: Value> Worker<V> {
    pub(crate) fn new(heap: WorkerHeap<V>) -> Self {
        Self {
            state: EvenOddLock::new(WorkerState {
                heap,
                largest: None,
            }),
            announce: AnnounceSlot::new(),
            leader_count: CachePadded::new(AtomicI64::new(0)),
            repeat_keys: AtomicI64::new(0),
            stats: CachePadded::new(WorkerStats::new()),
            registered: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn leader_count(&self) -> i64 {
        self.leader_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn add_repeat_key(&self, key: Key) {
        self.repeat_keys.fetch_add(key, Ordering::Relaxed);
    }
}

/// Zone and worker index of a thread id, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThreadSlot {
    pub(crate) zone: usize,
    pub(crate) idx: usize,
    pub(crate) cpu: Option<usize>,
}

/// A thread's handle on the queue, returned by [`Pipq::thread_init`].
///
/// Every operation goes through the context. It is tied to the thread that
/// created it (`!Send`); dropping it lets the thread id be initialized again.
pub struct ThreadContext<'q, V: Value> {
    pub(crate) pq: &'q Pipq<V>,
    pub(crate) tid: usize,
    pub(crate) slot: ThreadSlot,
    pub(crate) handle: LocalHandle<'q>,
}

impl<'q, V: Value> ThreadContext<'q, V> {
    /// Inserts `(key, value)`.
    ///
    /// Returns `false` if the entry was bound for the leader set and an
    /// identical live entry was already there; the entry is dropped.
    pub fn insert(&self, key: Key, value: V) -> bool {
        self.pq.insert_local(self, key, value)
    }

    /// Removes the smallest entry, or returns `None` if the queue is empty.
    pub fn delete_min(&self) -> Option<(Key, V)> {
        self.pq.delete_min_local(self).map(|e| (e.key, e.value))
    }

    /// Removes the smallest entry and returns its key, or
    /// [`EMPTY_KEY`](crate::EMPTY_KEY) if the queue is empty.
    pub fn delete_min_key(&self) -> Key {
        self.pq
            .delete_min_local(self)
            .map_or(crate::config::EMPTY_KEY, |e| e.key)
    }

    /// Removes the smallest entry along with the worker that inserted it.
    pub fn delete_min_entry(&self) -> Option<LeaderEntry<V>> {
        self.pq.delete_min_local(self)
    }

    /// Thread id.
    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Zone this thread's worker lives in.
    pub fn zone(&self) -> usize {
        self.slot.zone
    }

    /// Worker index within the zone.
    pub fn idx(&self) -> usize {
        self.slot.idx
    }

    /// CPU the placement assigned, pinned or not.
    pub fn cpu(&self) -> Option<usize> {
        self.slot.cpu
    }

    /// Owner id stamped on this thread's leader entries.
    pub fn owner(&self) -> Owner {
        Owner::new(self.slot.zone, self.slot.idx)
    }

    #[inline]
    pub(crate) fn worker(&self) -> &'q Worker<V> {
        self.pq.worker(self.slot.zone, self.slot.idx)
    }
}

impl<V: Value> Drop for ThreadContext<'_, V> {
    fn drop(&mut self) {
        self.handle.pin().flush();
        self.worker().registered.store(false, Ordering::Release);
    }
}

impl<V: Value> core::fmt::Debug for ThreadContext<'_, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("tid", &self.tid)
            .field("zone", &self.slot.zone)
            .field("idx", &self.slot.idx)
            .field("cpu", &self.slot.cpu)
            .finish()
    }
}
