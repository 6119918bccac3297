//! PIPQ: a NUMA-hierarchical concurrent priority queue
//!
//! Every thread owns a sequential worker heap allocated on its NUMA node.
//! A shared lock-free leader set holds the few smallest entries of every
//! worker, and a single coordinator serves delete-min requests from it on
//! behalf of a whole zone at a time.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────── leader set (Harris list) ────────────┐
//!   delete_min ──►     │ head ─► 1 ─► 2 ─► 4 ─► 7 ─► 9 ─► null            │
//!   coordinator        └───▲─────────────▲─────────────▲──────────────────┘
//!   (one at a time)        │ upsert      │             │ refill
//!                 ┌────────┴───┐  ┌──────┴─────┐  ┌────┴───────┐
//!                 │ worker 0.0 │  │ worker 0.1 │  │ worker 1.0 │ ...
//!                 │ heap (node │  │ heap (node │  │ heap (node │
//!                 │ 0 memory)  │  │ 0 memory)  │  │ 1 memory)  │
//!                 └────────────┘  └────────────┘  └────────────┘
//!                 └──────── zone 0 ────────────┘  └─ zone 1 ───┘
//! ```
//!
//! - [`leader`]: lock-free sorted set with Linden-style delete-min
//! - [`worker`]: chunked, node-local binary heaps
//! - [`pq`]: insertion path, announce/coordinate delete-min, diagnostics
//! - [`epoch`]: reclamation of unlinked leader nodes
//! - [`numa`]: topology, placement policies, node-bound allocation
//! - [`lock`]: the even/odd counter lock used for every lock in the queue
//!
//! # Example
//!
//! ```rust
//! use pipq::{Pipq, PqConfig};
//!
//! let pq = Pipq::<u64>::new(PqConfig::new(1)).unwrap();
//! let ctx = pq.thread_init(0).unwrap();
//!
//! for key in [5, 3, 9, 1] {
//!     ctx.insert(key, key as u64);
//! }
//! assert_eq!(ctx.delete_min(), Some((1, 1)));
//! assert_eq!(ctx.delete_min_key(), 3);
//! ```
//!
//! # Feature Flags
//!
//! - `numa` (default): bind node-local allocations with `mbind` on Linux
//! - `statistics`: epoch collector counters
//! - `loom`: build the sync shim against Loom for model checking
//!
//! # References
//!
//! - Timothy L. Harris. "A Pragmatic Implementation of Non-Blocking
//!   Linked-Lists." DISC, 2001.
//! - Jonatan Lindén and Bengt Jonsson. "A Skiplist-Based Concurrent Priority
//!   Queue with Minimal Memory Contention." OPODIS, 2013.
//! - Keir Fraser. "Practical Lock-Freedom." PhD thesis, Cambridge, 2004.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Conditional synchronization primitives for Loom integration
pub mod sync;

pub mod config;
pub mod epoch;
pub mod leader;
pub mod lock;
pub mod numa;
pub mod pq;
pub mod worker;

pub use config::{PqConfig, EMPTY_KEY};
pub use leader::{LeaderEntry, LeaderSet, Owner};
pub use lock::{EvenOddGuard, EvenOddLock, Spin};
pub use numa::{CpuBinding, CpuPolicy, NumaError, NumaTopology};
pub use pq::{DeinitReport, Pipq, PqStats, ThreadContext};
pub use worker::{HeapEntry, WorkerHeap};

/// Priority type. Smaller keys are served first.
pub type Key = i64;

/// Error types for the pipq crate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Rejected configuration
    InvalidConfig {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
    /// `thread_init` for a thread id the queue was not built for
    ThreadIdOutOfRange {
        /// Requested id
        tid: usize,
        /// Configured thread count
        total: usize,
    },
    /// `thread_init` for a thread id whose context is still alive
    ThreadAlreadyRegistered {
        /// Requested id
        tid: usize,
    },
    /// Topology, allocation or pinning failure
    Numa(NumaError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidConfig { field, reason } => {
                write!(f, "invalid configuration for {}: {}", field, reason)
            }
            Error::ThreadIdOutOfRange { tid, total } => {
                write!(f, "thread id {} out of range (total threads {})", tid, total)
            }
            Error::ThreadAlreadyRegistered { tid } => {
                write!(f, "thread id {} is already registered", tid)
            }
            Error::Numa(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Numa(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NumaError> for Error {
    fn from(e: NumaError) -> Self {
        Error::Numa(e)
    }
}

/// Result type for pipq operations
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::ThreadIdOutOfRange { tid: 9, total: 4 };
        assert_eq!(e.to_string(), "thread id 9 out of range (total threads 4)");

        let e: Error = NumaError::InvalidNode(3).into();
        assert!(matches!(e, Error::Numa(NumaError::InvalidNode(3))));
        assert!(std::error::Error::source(&e).is_some());
    }
}
