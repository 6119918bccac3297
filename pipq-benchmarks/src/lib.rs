//! Shared command-line surface of the `microbench` and `sssp` drivers.

use clap::Args;
use pipq::{CpuBinding, CpuPolicy, PqConfig};
use tracing_subscriber::EnvFilter;

/// Queue layout flags common to every driver.
#[derive(Debug, Clone, Args)]
pub struct PqArgs {
    /// Worker heap chunk size in entries
    #[arg(long, default_value_t = pipq::config::DEFAULT_HEAP_LIST_SIZE)]
    pub heap_list_size: usize,

    /// Leader buffer capacity (reported, not used on the hot path)
    #[arg(long, default_value_t = 50)]
    pub leader_buffer_cap: usize,

    /// Leader buffer ideal size (reported, not used on the hot path)
    #[arg(long, default_value_t = 30)]
    pub leader_buffer_ideal: usize,

    /// Leader count below which a worker pulls its minimum up on insert
    #[arg(long, default_value_t = 10)]
    pub counter_threshold: i64,

    /// Leader count at which inserts start evicting the worker's largest entry
    #[arg(long, default_value_t = 20)]
    pub counter_max: i64,

    /// Deleted-prefix length that triggers a head swing in the leader set
    #[arg(long, default_value_t = pipq::config::DEFAULT_MAX_OFFSET)]
    pub max_offset: usize,

    /// Thread placement: os, f1, f1hl, rr (or 0-3)
    #[arg(long, default_value = "f1")]
    pub cpu_policy: CpuPolicy,

    /// Explicit CPU list such as "1,2,3,8-11,4-7,0"; overrides the policy
    #[arg(long)]
    pub bind: Option<CpuBinding>,

    /// Pin every worker thread to its CPU
    #[arg(long)]
    pub pin: bool,
}

impl PqArgs {
    /// Builds a queue configuration for `threads` workers.
    pub fn config(&self, threads: usize) -> PqConfig {
        let mut config = PqConfig::new(threads)
            .with_heap_list_size(self.heap_list_size)
            .with_leader_buffer(self.leader_buffer_cap, self.leader_buffer_ideal)
            .with_counter_limits(self.counter_threshold, self.counter_max)
            .with_max_offset(self.max_offset)
            .with_cpu_policy(self.cpu_policy)
            .with_pinning(self.pin);
        if let Some(binding) = &self.bind {
            config = config.with_binding(binding.clone());
        }
        config
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
