//! The NUMA-hierarchical priority queue.
//!
//! # Structure
//!
//! ```text
//! Pipq
//! ├── leader: LeaderSet            smallest few entries of every worker
//! ├── coordinator: EvenOddLock     at most one delete-min batch at a time
//! ├── collector: Collector         reclaims unlinked leader nodes
//! └── zones[z]                     one per NUMA node
//!     ├── compete: EvenOddLock     elects the zone's coordinator candidate
//!     └── workers[i] (node-local)
//!         ├── state: EvenOddLock<WorkerHeap + largest leader entry>
//!         ├── announce: AnnounceSlot
//!         └── leader_count, repeat_keys, stats
//! ```
//!
//! # Invariants
//!
//! - A worker's heap minimum is never smaller than its live leader entries,
//!   so the leader minimum is the queue minimum while every non-empty
//!   worker has at least one leader entry.
//! - The coordinator refills a worker whose leader count drops below
//!   [`REFILL_THRESHOLD`](crate::config::REFILL_THRESHOLD).
//! - Entries whose leader insert finds an identical live entry are dropped
//!   and their keys added to the worker's repeat-keys sum, which
//!   [`Pipq::key_sum`] includes.
//!
//! Threads get a [`ThreadContext`] from [`Pipq::thread_init`] and perform
//! every operation through it. Diagnostics take `&mut self` and therefore
//! only run once every context is gone.

mod context;
mod coordinator;
mod insert;
mod stats;

pub use context::{AnnounceSlot, ThreadContext};
pub use stats::PqStats;

use context::{ThreadSlot, Worker};

use core::fmt;
use std::collections::HashMap;

use crossbeam_utils::CachePadded;
use tracing::{debug, info, warn};

use crate::config::PqConfig;
use crate::epoch::Collector;
use crate::leader::{LeaderSet, Owner};
use crate::lock::EvenOddLock;
use crate::numa::{pin_current_thread, AllocationPolicy, NodeId, NumaSlice, Placement};
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::worker::WorkerHeap;
use crate::{Error, Key, Result};

/// Payload stored alongside keys.
///
/// Entries are ordered by key, then by value, and an entry is a duplicate
/// only if both match.
pub trait Value: Copy + Ord + Send + Sync {}

impl<T: Copy + Ord + Send + Sync> Value for T {}

struct Zone<V: Copy> {
    compete: EvenOddLock<()>,
    workers: NumaSlice<Worker<V>>,
    node: NodeId,
}

/// NUMA-hierarchical concurrent priority queue.
///
/// # Example
///
/// ```rust
/// use pipq::{Pipq, PqConfig};
///
/// let mut pq = Pipq::<u32>::new(PqConfig::new(2)).unwrap();
/// std::thread::scope(|s| {
///     for tid in 0..2 {
///         let pq = &pq;
///         s.spawn(move || {
///             let ctx = pq.thread_init(tid).unwrap();
///             for k in 0..100 {
///                 ctx.insert(k * 2 + tid as i64, tid as u32);
///             }
///         });
///     }
/// });
/// assert_eq!(pq.size(), 200);
///
/// let ctx = pq.thread_init(0).unwrap();
/// assert_eq!(ctx.delete_min_key(), 0);
/// assert_eq!(ctx.delete_min_key(), 1);
/// ```
pub struct Pipq<V: Value> {
    zones: Box<[Zone<V>]>,
    threads: Box<[ThreadSlot]>,
    leader: LeaderSet<V>,
    coordinator: EvenOddLock<()>,
    collector: Collector,
    config: PqConfig,
    in_coordinate: CachePadded<AtomicUsize>,
    max_coordinators: AtomicUsize,
    validated: AtomicBool,
}

impl<V: Value> Pipq<V> {
    /// Builds the queue: validates `config`, maps every thread id to a zone
    /// and worker index, and allocates each zone's workers on its node.
    pub fn new(config: PqConfig) -> Result<Self> {
        config.validate()?;

        let topology = &config.topology;
        let num_zones = topology.num_nodes().max(1);
        let mut per_zone = vec![0usize; num_zones];

        let threads: Box<[ThreadSlot]> = (0..config.total_threads)
            .map(|tid| {
                let placement = Placement::resolve(
                    tid,
                    config.cpu_policy,
                    config.binding.as_ref(),
                    topology,
                );
                let zone = placement.zone % num_zones;
                let idx = per_zone[zone];
                per_zone[zone] += 1;
                ThreadSlot {
                    zone,
                    idx,
                    cpu: placement.cpu,
                }
            })
            .collect();

        let zones = per_zone
            .iter()
            .enumerate()
            .map(|(zone, &count)| -> Result<Zone<V>> {
                let node = NodeId(topology.zone(zone).map_or(zone as u32, |n| n.id()));
                let policy = AllocationPolicy::OnNode(node);
                let workers = NumaSlice::try_from_fn(count, policy, |_| {
                    WorkerHeap::new(config.heap_list_size, policy).map(Worker::new)
                })?;
                Ok(Zone {
                    compete: EvenOddLock::new(()),
                    workers,
                    node,
                })
            })
            .collect::<Result<Box<[_]>>>()?;

        info!(
            threads = config.total_threads,
            zones = num_zones,
            workers_per_zone = ?per_zone,
            policy = %config.cpu_policy,
            counter_threshold = config.counter_threshold,
            counter_max = config.counter_max,
            max_offset = config.max_offset,
            "pipq initialized"
        );

        Ok(Self {
            zones,
            threads,
            leader: LeaderSet::new(config.max_offset),
            coordinator: EvenOddLock::new(()),
            collector: Collector::new(config.total_threads),
            in_coordinate: CachePadded::new(AtomicUsize::new(0)),
            max_coordinators: AtomicUsize::new(0),
            validated: AtomicBool::new(false),
            config,
        })
    }

    /// Registers thread `tid` and, if configured, pins it to its CPU.
    ///
    /// At most one context per thread id exists at a time. The context must
    /// be used on the thread that created it.
    pub fn thread_init(&self, tid: usize) -> Result<ThreadContext<'_, V>> {
        let slot = *self.threads.get(tid).ok_or(Error::ThreadIdOutOfRange {
            tid,
            total: self.threads.len(),
        })?;

        let worker = self.worker(slot.zone, slot.idx);
        if worker.registered.swap(true, Ordering::AcqRel) {
            return Err(Error::ThreadAlreadyRegistered { tid });
        }
        let Some(handle) = self.collector.register() else {
            worker.registered.store(false, Ordering::Release);
            return Err(Error::ThreadAlreadyRegistered { tid });
        };

        if self.config.pin_threads {
            if let Some(cpu) = slot.cpu {
                if let Err(e) = pin_current_thread(cpu) {
                    warn!(tid, cpu, error = %e, "pinning failed, running unpinned");
                }
            }
        }
        debug!(tid, zone = slot.zone, idx = slot.idx, cpu = ?slot.cpu, "thread initialized");

        Ok(ThreadContext {
            pq: self,
            tid,
            slot,
            handle,
        })
    }

    /// The configuration the queue was built with.
    pub fn config(&self) -> &PqConfig {
        &self.config
    }

    /// Number of zones.
    pub fn num_zones(&self) -> usize {
        self.zones.len()
    }

    /// Number of workers in `zone`.
    pub fn workers_in_zone(&self, zone: usize) -> usize {
        self.zones.get(zone).map_or(0, |z| z.workers.len())
    }

    /// Node backing `zone`'s memory.
    pub fn zone_node(&self, zone: usize) -> Option<NodeId> {
        self.zones.get(zone).map(|z| z.node)
    }

    /// `(zone, idx)` assigned to `tid`.
    pub fn placement_of(&self, tid: usize) -> Option<(usize, usize)> {
        self.threads.get(tid).map(|s| (s.zone, s.idx))
    }

    /// Aggregated operation counters.
    pub fn stats(&self) -> PqStats {
        let mut total = PqStats::default();
        for worker in self.workers() {
            worker.stats.accumulate(&mut total);
        }
        total
    }

    /// Resets every operation counter, e.g. after a prefill phase.
    pub fn clear_counters(&self) {
        for worker in self.workers() {
            worker.stats.clear();
        }
    }

    /// Highest number of threads ever observed inside a coordinator batch.
    pub fn max_concurrent_coordinators(&self) -> usize {
        self.max_coordinators.load(Ordering::Relaxed)
    }

    /// Returns `true` once [`validate_insertion_ordering`](Self::validate_insertion_ordering)
    /// has run.
    pub fn validated(&self) -> bool {
        self.validated.load(Ordering::Relaxed)
    }

    /// Entries in the leader set plus all worker heaps.
    pub fn size(&mut self) -> usize {
        self.leader_size() + self.worker_size()
    }

    /// Live entries in the leader set.
    pub fn leader_size(&mut self) -> usize {
        let guard = self.collector.quiescent();
        self.leader.len(&guard)
    }

    /// Entries in all worker heaps.
    pub fn worker_size(&mut self) -> usize {
        self.zones
            .iter_mut()
            .flat_map(|z| z.workers.iter_mut())
            .map(|w| w.state.get_mut().heap.len())
            .sum()
    }

    /// Sum of every key in the queue plus the repeat-keys sums (wrapping).
    pub fn key_sum(&mut self) -> Key {
        let Self {
            zones,
            leader,
            collector,
            ..
        } = self;
        let guard = collector.quiescent();
        zones
            .iter_mut()
            .flat_map(|z| z.workers.iter_mut())
            .fold(leader.key_sum(&guard), |acc, w| {
                let repeat = w.repeat_keys.load(Ordering::Relaxed);
                acc.wrapping_add(w.state.get_mut().heap.key_sum())
                    .wrapping_add(repeat)
            })
    }

    /// Checks that the leader set is sorted and that no worker's heap
    /// minimum is below the largest leader entry it owns. Returns the number
    /// of violations; the structure is left intact.
    pub fn validate_insertion_ordering(&mut self) -> usize {
        let Self {
            zones,
            leader,
            collector,
            validated,
            ..
        } = self;
        let guard = collector.quiescent();

        let mut violations = leader.order_violations(&guard);
        if violations > 0 {
            warn!(violations, "leader set out of order");
        }

        let mut largest: HashMap<Owner, Key> = HashMap::new();
        for e in leader.iter(&guard) {
            let slot = largest.entry(e.owner).or_insert(e.key);
            *slot = (*slot).max(e.key);
        }

        for (z, zone) in zones.iter_mut().enumerate() {
            for (i, worker) in zone.workers.iter_mut().enumerate() {
                let Some(min) = worker.state.get_mut().heap.peek() else {
                    continue;
                };
                if let Some(&lead) = largest.get(&Owner::new(z, i)) {
                    if lead > min.key {
                        warn!(zone = z, idx = i, leader = lead, worker_min = min.key,
                            "worker minimum below its leader entries");
                        violations += 1;
                    }
                }
            }
        }

        validated.store(true, Ordering::Relaxed);
        violations
    }

    /// Tears the queue down and reports its final state.
    pub fn deinit(mut self) -> DeinitReport {
        let leader_size = self.leader_size();
        let worker_size = self.worker_size();
        let report = DeinitReport {
            key_sum: self.key_sum(),
            leader_size,
            worker_size,
            stats: self.stats(),
            max_concurrent_coordinators: self.max_concurrent_coordinators(),
            validated: self.validated(),
        };
        info!(
            key_sum = report.key_sum,
            size = report.size(),
            leader = leader_size,
            workers = worker_size,
            avg_delmin_ops = report.stats.avg_delmin_ops(),
            "pipq deinit"
        );
        report
    }

    #[inline]
    pub(crate) fn worker(&self, zone: usize, idx: usize) -> &Worker<V> {
        &self.zones[zone].workers[idx]
    }

    #[inline]
    pub(crate) fn owner_worker(&self, owner: Owner) -> &Worker<V> {
        self.worker(owner.zone as usize, owner.idx as usize)
    }

    fn workers(&self) -> impl Iterator<Item = &Worker<V>> {
        self.zones.iter().flat_map(|z| z.workers.iter())
    }
}

impl<V: Value> fmt::Debug for Pipq<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipq")
            .field("threads", &self.threads.len())
            .field("zones", &self.zones.len())
            .field("max_offset", &self.leader.max_offset())
            .finish_non_exhaustive()
    }
}

/// Final state of a queue, returned by [`Pipq::deinit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeinitReport {
    /// Key sum at teardown, repeat-keys included
    pub key_sum: Key,
    /// Live leader entries
    pub leader_size: usize,
    /// Worker heap entries
    pub worker_size: usize,
    /// Operation counters
    pub stats: PqStats,
    /// Highest coordinator concurrency observed
    pub max_concurrent_coordinators: usize,
    /// Whether ordering validation ran
    pub validated: bool,
}

impl DeinitReport {
    /// Total entries left in the queue.
    pub fn size(&self) -> usize {
        self.leader_size + self.worker_size
    }

    /// Key sum captured at teardown.
    pub fn debug_key_sum(&self) -> Key {
        self.key_sum
    }
}

impl fmt::Display for DeinitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "key sum:          {}", self.key_sum)?;
        writeln!(
            f,
            "size:             {} (leader {}, workers {})",
            self.size(),
            self.leader_size,
            self.worker_size
        )?;
        writeln!(f, "{}", self.stats)?;
        write!(f, "max coordinators: {}", self.max_concurrent_coordinators)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::config::REFILL_THRESHOLD;
    use crate::numa::{CpuPolicy, NumaTopology};
    use crate::worker::HeapEntry;
    use std::thread;

    fn config(threads: usize) -> PqConfig {
        PqConfig::new(threads)
            .with_topology(NumaTopology::uniform(2, 2, 1).unwrap())
            .with_heap_list_size(16)
    }

    #[test]
    fn test_thread_mapping_fill_one() {
        let pq = Pipq::<u32>::new(config(4)).unwrap();
        assert_eq!(pq.num_zones(), 2);
        assert_eq!(pq.workers_in_zone(0), 2);
        assert_eq!(pq.workers_in_zone(1), 2);
        assert_eq!(pq.placement_of(0), Some((0, 0)));
        assert_eq!(pq.placement_of(1), Some((0, 1)));
        assert_eq!(pq.placement_of(2), Some((1, 0)));
        assert_eq!(pq.placement_of(4), None);
    }

    #[test]
    fn test_thread_mapping_round_robin() {
        let pq = Pipq::<u32>::new(config(3).with_cpu_policy(CpuPolicy::RoundRobin)).unwrap();
        assert_eq!(pq.placement_of(1), Some((1, 0)));
        assert_eq!(pq.placement_of(2), Some((0, 1)));
        assert_eq!(pq.workers_in_zone(0), 2);
    }

    #[test]
    fn test_thread_init_errors() {
        let pq = Pipq::<u32>::new(config(2)).unwrap();
        assert!(matches!(
            pq.thread_init(2),
            Err(Error::ThreadIdOutOfRange { tid: 2, total: 2 })
        ));

        let ctx = pq.thread_init(1).unwrap();
        assert!(matches!(
            pq.thread_init(1),
            Err(Error::ThreadAlreadyRegistered { tid: 1 })
        ));
        drop(ctx);
        assert!(pq.thread_init(1).is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Pipq::<u32>::new(config(2).with_leader_buffer(1, 2)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_deinit_report() {
        let pq = Pipq::<u32>::new(config(1)).unwrap();
        {
            let ctx = pq.thread_init(0).unwrap();
            for k in [10, 20, 30] {
                assert!(ctx.insert(k, 0));
            }
            assert_eq!(ctx.delete_min_key(), 10);
        }
        let report = pq.deinit();
        assert_eq!(report.size(), 2);
        assert_eq!(report.debug_key_sum(), 50);
        assert_eq!(report.stats.requests_served, 1);
        assert_eq!(report.max_concurrent_coordinators, 1);
        assert!(!report.validated);
    }

    #[test]
    fn test_refill_skips_duplicate_and_promotes_next() {
        let pq = Pipq::<u32>::new(config(2)).unwrap();
        {
            let a = pq.thread_init(0).unwrap();
            let b = pq.thread_init(1).unwrap();
            assert_eq!(a.zone(), b.zone());

            assert!(a.insert(5, 0));
            assert!(b.insert(1, 0));
            {
                let mut state = b.worker().state.acquire();
                state.heap.push(HeapEntry::new(5, 0));
                state.heap.push(HeapEntry::new(7, 0));
            }

            // b's count drops to 0; the refill pops (5, 0), finds a's copy
            // in the leader set and moves on to (7, 0).
            assert_eq!(b.delete_min(), Some((1, 0)));
            assert_eq!(b.worker().repeat_keys.load(Ordering::Relaxed), 5);
            assert_eq!(b.worker().leader_count(), 1);
            assert!(b.worker().state.acquire().heap.is_empty());

            assert_eq!(a.delete_min_entry().map(|e| (e.key, e.owner)), Some((5, a.owner())));
            assert_eq!(a.delete_min_entry().map(|e| (e.key, e.owner)), Some((7, b.owner())));
            assert_eq!(a.delete_min(), None);
        }

        let report = pq.deinit();
        assert_eq!(report.size(), 0);
        assert_eq!(report.debug_key_sum(), 5);
        assert_eq!(report.stats.coord_pull_ups, 3);
    }

    #[test]
    fn test_coordinator_skips_refill_once_owner_caught_up() {
        let mut pq = Pipq::<u32>::new(config(2)).unwrap();
        {
            let b = pq.thread_init(1).unwrap();
            assert!(b.insert(1, 0));
            let worker = b.worker();
            let mut state = worker.state.acquire();
            for k in [10, 11, 12] {
                state.heap.push(HeapEntry::new(k, 0));
            }

            thread::scope(|s| {
                let pq = &pq;
                let requester = s.spawn(move || {
                    let a = pq.thread_init(0).unwrap();
                    a.delete_min()
                });

                // The coordinator has taken b's only leader entry and now
                // waits on b's worker lock.
                while worker.leader_count() != 0 {
                    thread::yield_now();
                }

                let guard = b.handle.pin();
                for _ in 0..REFILL_THRESHOLD {
                    let top = state.heap.pop().unwrap();
                    assert!(pq.upsert(top, &mut state, worker, b.owner(), &guard));
                }
                drop(guard);
                drop(state);

                assert_eq!(requester.join().unwrap(), Some((1, 0)));
            });

            assert_eq!(worker.leader_count(), REFILL_THRESHOLD);
        }

        assert_eq!(pq.leader_size(), 2);
        assert_eq!(pq.worker_size(), 1);
        assert_eq!(pq.key_sum(), 33);
        assert_eq!(pq.validate_insertion_ordering(), 0);
        assert_eq!(pq.stats().coord_pull_ups, 1);
    }
}
