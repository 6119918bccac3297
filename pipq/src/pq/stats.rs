//! Per-worker operation counters and their aggregate.
//!
//! Each worker's counters are written only by the thread owning the worker
//! (a coordinator records its batches on its own worker), so relaxed
//! increments suffice.

use core::fmt;

use crate::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct WorkerStats {
    pub(crate) moves: AtomicU64,
    pub(crate) insert_up: AtomicU64,
    pub(crate) help_upsert: AtomicU64,
    pub(crate) fast_path: AtomicU64,
    pub(crate) coord_pull_ups: AtomicU64,
    pub(crate) coordinate_calls: AtomicU64,
    pub(crate) requests_served: AtomicU64,
}

impl WorkerStats {
    pub(crate) fn new() -> Self {
        Self {
            moves: AtomicU64::new(0),
            insert_up: AtomicU64::new(0),
            help_upsert: AtomicU64::new(0),
            fast_path: AtomicU64::new(0),
            coord_pull_ups: AtomicU64::new(0),
            coordinate_calls: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, served: u64) {
        self.coordinate_calls.fetch_add(1, Ordering::Relaxed);
        self.requests_served.fetch_add(served, Ordering::Relaxed);
    }

    fn counters(&self) -> [&AtomicU64; 7] {
        [
            &self.moves,
            &self.insert_up,
            &self.help_upsert,
            &self.fast_path,
            &self.coord_pull_ups,
            &self.coordinate_calls,
            &self.requests_served,
        ]
    }

    pub(crate) fn clear(&self) {
        for c in self.counters() {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn accumulate(&self, into: &mut PqStats) {
        let [moves, insert_up, help_upsert, fast_path, pull_ups, calls, served] =
            self.counters().map(|c| c.load(Ordering::Relaxed));
        into.total_moves += moves;
        into.total_insert_up += insert_up;
        into.total_help_upsert += help_upsert;
        into.total_fast_path += fast_path;
        into.coord_pull_ups += pull_ups;
        into.coordinate_calls += calls;
        into.requests_served += served;
    }
}

/// Operation counters summed over all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PqStats {
    /// Inserts that evicted an entry from the leader set
    pub total_moves: u64,
    /// Inserts that went directly into the leader set
    pub total_insert_up: u64,
    /// Worker minimums pulled up while inserting or waiting on a lock
    pub total_help_upsert: u64,
    /// Inserts that went directly into a worker heap
    pub total_fast_path: u64,
    /// Refills performed by the coordinator
    pub coord_pull_ups: u64,
    /// Coordinator batches
    pub coordinate_calls: u64,
    /// Delete-min requests served across all batches
    pub requests_served: u64,
}

impl PqStats {
    /// Average number of delete-min requests served per coordinator batch.
    pub fn avg_delmin_ops(&self) -> f64 {
        if self.coordinate_calls == 0 {
            0.0
        } else {
            self.requests_served as f64 / self.coordinate_calls as f64
        }
    }
}

impl fmt::Display for PqStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "moves:            {}", self.total_moves)?;
        writeln!(f, "leader inserts:   {}", self.total_insert_up)?;
        writeln!(f, "help upserts:     {}", self.total_help_upsert)?;
        writeln!(f, "fast path:        {}", self.total_fast_path)?;
        writeln!(f, "coord pull-ups:   {}", self.coord_pull_ups)?;
        write!(
            f,
            "avg delmin ops:   {:.2} ({} requests / {} batches)",
            self.avg_delmin_ops(),
            self.requests_served,
            self.coordinate_calls
        )
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_and_clear() {
        let a = WorkerStats::new();
        let b = WorkerStats::new();
        WorkerStats::bump(&a.moves);
        WorkerStats::bump(&b.moves);
        WorkerStats::bump(&b.fast_path);
        a.record_batch(3);
        b.record_batch(1);

        let mut total = PqStats::default();
        a.accumulate(&mut total);
        b.accumulate(&mut total);
        assert_eq!(total.total_moves, 2);
        assert_eq!(total.total_fast_path, 1);
        assert_eq!(total.coordinate_calls, 2);
        assert!((total.avg_delmin_ops() - 2.0).abs() < f64::EPSILON);

        a.clear();
        let mut after = PqStats::default();
        a.accumulate(&mut after);
        assert_eq!(after, PqStats::default());
    }

    #[test]
    fn test_empty_average() {
        assert_eq!(PqStats::default().avg_delmin_ops(), 0.0);
    }
}
