//! NUMA Topology, Placement and Node-Local Allocation
//!
//! The priority queue partitions its worker heaps into zones, one per NUMA
//! node. This module answers three questions for it:
//!
//! 1. What zones exist and which CPUs belong to each ([`NumaTopology`])
//! 2. Which zone and CPU a given thread id goes to ([`CpuPolicy`],
//!    [`CpuBinding`], [`Placement`])
//! 3. How to get memory that lives on a zone's node ([`NumaAllocator`],
//!    [`NumaBuffer`], [`NumaSlice`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────┐     ┌─────────────────────────┐
//! │        Zone 0           │     │        Zone 1           │
//! │ CPUs 0,2,4,..           │     │ CPUs 1,3,5,..           │
//! │ ┌─────┐ ┌─────┐ ┌─────┐ │     │ ┌─────┐ ┌─────┐ ┌─────┐ │
//! │ │ W0  │ │ W1  │ │ ... │ │     │ │ W0  │ │ W1  │ │ ... │ │
//! │ └─────┘ └─────┘ └─────┘ │     │ └─────┘ └─────┘ └─────┘ │
//! │ worker heaps: node-local│     │ worker heaps: node-local│
//! └───────────┬─────────────┘     └───────────┬─────────────┘
//!             └──────────── leader set ───────┘
//! ```
//!
//! # Platform Support
//!
//! - Linux: topology from `/sys/devices/system/node`, `mbind` placement,
//!   `sched_setaffinity` pinning
//! - Elsewhere: single-node fallback, system allocator, pinning unsupported

mod allocator;
mod placement;
mod topology;

pub use allocator::{AllocationPolicy, NumaAllocator, NumaBuffer, NumaSlice};
pub use placement::{pin_current_thread, CpuBinding, CpuPolicy, Placement};
pub use topology::{CpuSet, NodeId, NumaTopology};

pub(crate) use topology::parse_cpu_list;

/// Error types for NUMA operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumaError {
    /// Memory allocation failed
    AllocationFailed,

    /// Invalid NUMA node ID
    InvalidNode(u32),

    /// Pinning the calling thread failed
    PinFailed {
        /// Requested CPU
        cpu: usize,
        /// OS error code (0 when unsupported on this platform)
        errno: i32,
    },

    /// Topology could not be read or is empty
    TopologyUnavailable,
}

impl core::fmt::Display for NumaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NumaError::AllocationFailed => write!(f, "NUMA allocation failed"),
            NumaError::InvalidNode(n) => write!(f, "invalid NUMA node: {}", n),
            NumaError::PinFailed { cpu, errno } => {
                write!(f, "failed to pin thread to cpu {} (errno {})", cpu, errno)
            }
            NumaError::TopologyUnavailable => write!(f, "NUMA topology unavailable"),
        }
    }
}

impl std::error::Error for NumaError {}

/// Result type for NUMA operations
pub type Result<T> = core::result::Result<T, NumaError>;

/// A NUMA node with its associated resources.
#[derive(Debug, Clone)]
pub struct NumaNode {
    id: u32,
    cpus: CpuSet,
    total_memory: u64,
}

impl NumaNode {
    /// Creates a new NUMA node.
    pub(crate) fn new(id: u32, cpus: CpuSet, total_memory: u64) -> Self {
        Self {
            id,
            cpus,
            total_memory,
        }
    }

    /// Returns the node ID.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the CPUs associated with this node.
    #[inline]
    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    /// Returns the total memory in bytes (0 if unknown).
    #[inline]
    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Returns the `n`th CPU of this node in ascending order, wrapping.
    pub fn nth_cpu(&self, n: usize) -> Option<usize> {
        let count = self.cpus.count();
        if count == 0 {
            return None;
        }
        self.cpus.iter().nth(n % count).map(|c| c as usize)
    }
}
