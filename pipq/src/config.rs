//! Queue configuration and compile-time constants.

use crate::numa::{CpuBinding, CpuPolicy, NumaTopology};
use crate::{Error, Key, Result};

/// Key reported by [`ThreadContext::delete_min_key`](crate::ThreadContext::delete_min_key)
/// when the queue is empty.
pub const EMPTY_KEY: Key = -1;

/// Entries per worker heap chunk.
pub const DEFAULT_HEAP_LIST_SIZE: usize = 65_536;

/// Delete-min traversal length after which the leader head is swung.
pub const DEFAULT_MAX_OFFSET: usize = 24;

/// A worker whose leader count drops below this is refilled by the coordinator.
pub const REFILL_THRESHOLD: i64 = 2;

/// Cache line size for alignment
pub const CACHE_LINE_SIZE: usize = 64;

/// Default NUMA node count limit
pub const MAX_NUMA_NODES: usize = 64;

/// Construction parameters for [`Pipq`](crate::Pipq).
///
/// ```rust
/// use pipq::config::PqConfig;
/// use pipq::numa::CpuPolicy;
///
/// let config = PqConfig::new(8)
///     .with_counter_limits(4, 8)
///     .with_cpu_policy(CpuPolicy::RoundRobin);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PqConfig {
    /// Entries per worker heap chunk
    pub heap_list_size: usize,
    /// Leader buffer capacity (validated and reported only)
    pub leader_buffer_capacity: usize,
    /// Ideal leader buffer occupancy (validated and reported only)
    pub leader_buffer_ideal: usize,
    /// Number of threads that will call `thread_init`
    pub total_threads: usize,
    /// Below this leader count an inserting worker pulls its minimum up
    pub counter_threshold: i64,
    /// At this leader count a smaller insert evicts instead of adding
    pub counter_max: i64,
    /// Leader delete-min head swing threshold
    pub max_offset: usize,
    /// Zones and CPUs
    pub topology: NumaTopology,
    /// Thread to zone/CPU policy
    pub cpu_policy: CpuPolicy,
    /// Explicit CPU list overriding the policy
    pub binding: Option<CpuBinding>,
    /// Pin threads in `thread_init`
    pub pin_threads: bool,
}

impl PqConfig {
    /// Default configuration for `total_threads` on the discovered topology.
    pub fn new(total_threads: usize) -> Self {
        Self {
            heap_list_size: DEFAULT_HEAP_LIST_SIZE,
            leader_buffer_capacity: 50,
            leader_buffer_ideal: 30,
            total_threads,
            counter_threshold: 10,
            counter_max: 20,
            max_offset: DEFAULT_MAX_OFFSET,
            topology: NumaTopology::get().clone(),
            cpu_policy: CpuPolicy::default(),
            binding: None,
            pin_threads: false,
        }
    }

    /// Sets the worker heap chunk size.
    pub fn with_heap_list_size(mut self, size: usize) -> Self {
        self.heap_list_size = size;
        self
    }

    /// Sets leader buffer capacity and ideal occupancy.
    pub fn with_leader_buffer(mut self, capacity: usize, ideal: usize) -> Self {
        self.leader_buffer_capacity = capacity;
        self.leader_buffer_ideal = ideal;
        self
    }

    /// Sets the pull-up threshold and the eviction limit.
    pub fn with_counter_limits(mut self, threshold: i64, max: i64) -> Self {
        self.counter_threshold = threshold;
        self.counter_max = max;
        self
    }

    /// Sets the head swing threshold.
    pub fn with_max_offset(mut self, max_offset: usize) -> Self {
        self.max_offset = max_offset;
        self
    }

    /// Uses an explicit topology.
    pub fn with_topology(mut self, topology: NumaTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Sets the placement policy.
    pub fn with_cpu_policy(mut self, policy: CpuPolicy) -> Self {
        self.cpu_policy = policy;
        self
    }

    /// Sets an explicit CPU binding.
    pub fn with_binding(mut self, binding: CpuBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Enables or disables pinning in `thread_init`.
    pub fn with_pinning(mut self, pin: bool) -> Self {
        self.pin_threads = pin;
        self
    }

    /// Checks the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> Result<()> {
            Err(Error::InvalidConfig {
                field,
                reason: reason.into(),
            })
        }

        if self.total_threads == 0 {
            return invalid("total_threads", "must be at least 1");
        }
        if self.heap_list_size == 0 {
            return invalid("heap_list_size", "must be at least 1");
        }
        if self.max_offset == 0 {
            return invalid("max_offset", "must be at least 1");
        }
        if self.leader_buffer_ideal > self.leader_buffer_capacity {
            return invalid(
                "leader_buffer_ideal",
                format!(
                    "ideal {} exceeds capacity {}",
                    self.leader_buffer_ideal, self.leader_buffer_capacity
                ),
            );
        }
        if self.counter_threshold < 1 {
            return invalid("counter_threshold", "must be at least 1");
        }
        if self.counter_threshold > self.counter_max {
            return invalid(
                "counter_threshold",
                format!(
                    "threshold {} exceeds counter max {}",
                    self.counter_threshold, self.counter_max
                ),
            );
        }
        if self.topology.num_nodes() > MAX_NUMA_NODES {
            return invalid(
                "topology",
                format!("{} zones, at most {}", self.topology.num_nodes(), MAX_NUMA_NODES),
            );
        }
        if self.pin_threads
            && self.binding.is_none()
            && self.cpu_policy != CpuPolicy::OperatingSystem
            && self.total_threads > self.topology.num_cpus()
        {
            return invalid(
                "total_threads",
                format!(
                    "{} pinned threads on {} CPUs",
                    self.total_threads,
                    self.topology.num_cpus()
                ),
            );
        }
        Ok(())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn small() -> PqConfig {
        PqConfig::new(4).with_topology(NumaTopology::uniform(2, 2, 1).unwrap())
    }

    #[test]
    fn test_defaults_validate() {
        let config = small();
        assert!(config.validate().is_ok());
        assert_eq!(config.counter_threshold, 10);
        assert_eq!(config.counter_max, 20);
        assert_eq!(config.max_offset, DEFAULT_MAX_OFFSET);
    }

    #[test]
    fn test_ideal_above_capacity_rejected() {
        let err = small().with_leader_buffer(10, 20).validate().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig {
                field: "leader_buffer_ideal",
                ..
            }
        ));
    }

    #[test]
    fn test_counter_limits() {
        assert!(small().with_counter_limits(5, 4).validate().is_err());
        assert!(small().with_counter_limits(0, 4).validate().is_err());
        assert!(small().with_counter_limits(4, 4).validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(PqConfig::new(0).validate().is_err());
        assert!(small().with_heap_list_size(0).validate().is_err());
        assert!(small().with_max_offset(0).validate().is_err());
    }

    #[test]
    fn test_pinning_needs_enough_cpus() {
        let config = PqConfig::new(8)
            .with_topology(NumaTopology::uniform(2, 2, 1).unwrap())
            .with_pinning(true);
        assert!(config.validate().is_err());
        assert!(config.clone().with_pinning(false).validate().is_ok());
        assert!(config
            .with_cpu_policy(CpuPolicy::OperatingSystem)
            .validate()
            .is_ok());
    }
}
