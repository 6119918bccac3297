//! Insertion path.
//!
//! Under the caller's worker lock, an entry goes either to the leader set
//! (it would be the worker's new minimum) or to the worker heap. Entries
//! compare by `(key, value)`:
//!
//! ```text
//!   entry < worker min (or worker empty)?
//!   ├── yes, leader count < counter_max ──► leader insert, count + 1
//!   ├── yes, count at max, >= largest ─────► worker heap
//!   ├── yes, count at max ────────────────► leader insert, evict the
//!   │                                       worker's largest leader entry
//!   │                                       into the heap
//!   └── no ──► worker heap; if count < counter_threshold, pull the heap
//!              minimum up into the leader set
//! ```

use super::context::{ThreadContext, Worker, WorkerState};
use super::stats::WorkerStats;
use super::{Pipq, Value};
use crate::epoch::Guard;
use crate::leader::{MoveOutcome, Owner};
use crate::sync::atomic::Ordering;
use crate::worker::HeapEntry;
use crate::Key;

impl<V: Value> Pipq<V> {
    pub(crate) fn insert_local(&self, ctx: &ThreadContext<'_, V>, key: Key, value: V) -> bool {
        let worker = ctx.worker();
        let owner = ctx.owner();
        let entry = HeapEntry::new(key, value);
        let guard = ctx.handle.pin();
        let mut state = worker.state.acquire();

        let leader_bound = state.heap.peek().map_or(true, |min| entry < min);
        if !leader_bound {
            state.heap.push(entry);
            WorkerStats::bump(&worker.stats.fast_path);

            if worker.leader_count() < self.config.counter_threshold {
                if let Some(top) = state.heap.pop() {
                    if self.upsert(top, &mut state, worker, owner, &guard) {
                        WorkerStats::bump(&worker.stats.help_upsert);
                    }
                }
            }
            return true;
        }

        if worker.leader_count() < self.config.counter_max {
            if !self.leader.insert(key, value, owner, &guard) {
                return false;
            }
            worker.leader_count.fetch_add(1, Ordering::AcqRel);
            state.raise_largest(entry);
            WorkerStats::bump(&worker.stats.insert_up);
            return true;
        }

        if state.largest.is_some_and(|largest| entry >= largest) {
            state.heap.push(entry);
            WorkerStats::bump(&worker.stats.fast_path);
            return true;
        }

        WorkerStats::bump(&worker.stats.moves);
        match self.leader.insert_and_move(key, value, owner, &guard) {
            MoveOutcome::Duplicate => false,
            MoveOutcome::Moved {
                evicted,
                next_largest,
            } => {
                state.heap.push(evicted);
                state.largest = next_largest.max(Some(entry));
                true
            }
            MoveOutcome::NothingToMove => {
                worker.leader_count.fetch_add(1, Ordering::AcqRel);
                state.raise_largest(entry);
                true
            }
        }
    }

    /// Moves `entry`, just popped from `worker`'s heap, into the leader set.
    /// A duplicate is dropped into the worker's repeat-keys sum.
    pub(crate) fn upsert(
        &self,
        entry: HeapEntry<V>,
        state: &mut WorkerState<V>,
        worker: &Worker<V>,
        owner: Owner,
        guard: &Guard<'_>,
    ) -> bool {
        if worker.leader_count() == 0 {
            state.largest = None;
        }
        if self.leader.insert(entry.key, entry.value, owner, guard) {
            worker.leader_count.fetch_add(1, Ordering::AcqRel);
            state.raise_largest(entry);
            true
        } else {
            worker.add_repeat_key(entry.key);
            false
        }
    }

    /// Pops from `worker`'s heap until one entry lands in the leader set or
    /// the heap runs dry.
    pub(crate) fn refill(
        &self,
        state: &mut WorkerState<V>,
        worker: &Worker<V>,
        owner: Owner,
        guard: &Guard<'_>,
    ) -> bool {
        while let Some(top) = state.heap.pop() {
            if self.upsert(top, state, worker, owner, guard) {
                return true;
            }
        }
        false
    }

    /// Tops up the caller's own leader entries while it waits on a lock.
    pub(crate) fn help_upsert(&self, ctx: &ThreadContext<'_, V>, guard: &Guard<'_>) {
        let worker = ctx.worker();
        if worker.leader_count() >= self.config.counter_threshold {
            return;
        }
        let Some(mut state) = worker.state.try_acquire() else {
            return;
        };
        if self.refill(&mut state, worker, ctx.owner(), guard) {
            WorkerStats::bump(&worker.stats.help_upsert);
        }
    }
}
