//! NUMA Topology Discovery
//!
//! A topology is an ordered list of nodes (zones) and the CPUs of each. It is
//! either discovered from the running system or described explicitly with
//! [`NumaTopology::uniform`], which reproduces the common interleaved layout
//! where CPU `c` belongs to zone `c % zones` and hyperthread siblings follow
//! all physical cores.

use std::sync::OnceLock;

use super::{NumaError, NumaNode, Result};

/// System topology, discovered once.
static TOPOLOGY: OnceLock<NumaTopology> = OnceLock::new();

/// Number of 64-bit words in a [`CpuSet`].
const CPU_WORDS: usize = 16;

/// Largest CPU id a [`CpuSet`] can hold, plus one.
const MAX_CPUS: u32 = (CPU_WORDS * 64) as u32;

/// A set of CPU IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet {
    mask: [u64; CPU_WORDS],
}

impl CpuSet {
    /// Creates an empty CPU set.
    pub const fn new() -> Self {
        Self {
            mask: [0; CPU_WORDS],
        }
    }

    /// Adds a CPU to the set.
    pub fn insert(&mut self, cpu: u32) {
        if cpu < MAX_CPUS {
            self.mask[(cpu / 64) as usize] |= 1 << (cpu % 64);
        }
    }

    /// Checks if a CPU is in the set.
    pub fn contains(&self, cpu: u32) -> bool {
        cpu < MAX_CPUS && (self.mask[(cpu / 64) as usize] & (1 << (cpu % 64))) != 0
    }

    /// Returns the number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.mask.iter().map(|m| m.count_ones() as usize).sum()
    }

    /// Returns the CPUs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_CPUS).filter(|&cpu| self.contains(cpu))
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.mask.iter().all(|&m| m == 0)
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CpuSet::new();
        for cpu in iter {
            set.insert(cpu as u32);
        }
        set
    }
}

/// A NUMA node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Creates a new node ID.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Parses a Linux-style CPU list such as `"0-3,8,10-11"`.
///
/// Order and repetitions are preserved. Returns `None` on any malformed
/// entry or a reversed range.
pub(crate) fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                if lo > hi {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().ok()?),
        }
    }
    Some(cpus)
}

/// NUMA topology information.
///
/// Zone `i` of the priority queue is `nodes()[i]`; the node's id is what
/// allocations bind to.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    nodes: Vec<NumaNode>,
    threads_per_core: usize,
    numa_available: bool,
}

impl NumaTopology {
    /// Gets or initializes the system topology.
    pub fn get() -> &'static Self {
        TOPOLOGY.get_or_init(|| Self::discover().unwrap_or_else(|_| Self::fallback()))
    }

    /// Discovers the system's NUMA topology.
    pub fn discover() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            Self::discover_linux()
        }

        #[cfg(not(target_os = "linux"))]
        {
            Ok(Self::fallback())
        }
    }

    /// Creates a single-node topology over every available CPU.
    pub fn fallback() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);

        Self {
            nodes: vec![NumaNode::new(0, (0..num_cpus).collect(), 0)],
            threads_per_core: 1,
            numa_available: false,
        }
    }

    /// Describes `zones` nodes of `cores_per_zone` cores with
    /// `threads_per_core` hardware threads each.
    ///
    /// CPU ids are interleaved across zones, hyperthread siblings last:
    ///
    /// ```text
    /// zones = 2, cores_per_zone = 2, threads_per_core = 2
    ///   zone 0: 0 2 | 4 6
    ///   zone 1: 1 3 | 5 7
    ///           ^^^   ^^^ siblings
    /// ```
    pub fn uniform(zones: usize, cores_per_zone: usize, threads_per_core: usize) -> Result<Self> {
        if zones == 0 || cores_per_zone == 0 || threads_per_core == 0 {
            return Err(NumaError::TopologyUnavailable);
        }

        let num_cores = zones * cores_per_zone;
        let nodes = (0..zones)
            .map(|zone| {
                let cpus = (0..threads_per_core)
                    .flat_map(|ht| {
                        (0..cores_per_zone).map(move |core| zone + core * zones + ht * num_cores)
                    })
                    .collect();
                NumaNode::new(zone as u32, cpus, 0)
            })
            .collect();

        Ok(Self {
            nodes,
            threads_per_core,
            numa_available: false,
        })
    }

    /// Linux-specific topology discovery.
    #[cfg(target_os = "linux")]
    fn discover_linux() -> Result<Self> {
        use std::fs;
        use std::path::Path;

        let numa_path = Path::new("/sys/devices/system/node");
        if !numa_path.exists() {
            return Ok(Self::fallback());
        }

        let mut node_ids: Vec<u32> = fs::read_dir(numa_path)
            .map_err(|_| NumaError::TopologyUnavailable)?
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str()?.strip_prefix("node")?.parse::<u32>().ok()
            })
            .collect();

        if node_ids.is_empty() {
            return Ok(Self::fallback());
        }
        node_ids.sort_unstable();

        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let node_path = numa_path.join(format!("node{}", node_id));

            let cpus: CpuSet = fs::read_to_string(node_path.join("cpulist"))
                .ok()
                .and_then(|list| parse_cpu_list(&list))
                .unwrap_or_default()
                .into_iter()
                .collect();

            // Memory-only nodes cannot host workers.
            if cpus.is_empty() {
                continue;
            }

            let memory = fs::read_to_string(node_path.join("meminfo"))
                .ok()
                .and_then(|content| {
                    content
                        .lines()
                        .find(|line| line.contains("MemTotal:"))
                        .and_then(|line| line.split_whitespace().nth(3))
                        .and_then(|kb| kb.parse::<u64>().ok())
                })
                .map(|kb| kb * 1024)
                .unwrap_or(0);

            nodes.push(NumaNode::new(node_id, cpus, memory));
        }

        if nodes.is_empty() {
            return Ok(Self::fallback());
        }

        let threads_per_core =
            fs::read_to_string("/sys/devices/system/cpu/cpu0/topology/thread_siblings_list")
                .ok()
                .and_then(|list| parse_cpu_list(&list))
                .map(|siblings| siblings.len().max(1))
                .unwrap_or(1);

        Ok(Self {
            nodes,
            threads_per_core,
            numa_available: true,
        })
    }

    /// Returns the number of NUMA nodes (zones).
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the total number of CPUs across all nodes.
    pub fn num_cpus(&self) -> usize {
        self.nodes.iter().map(|n| n.cpus().count()).sum()
    }

    /// Hardware threads per physical core.
    #[inline]
    pub fn threads_per_core(&self) -> usize {
        self.threads_per_core
    }

    /// Physical cores in zone `zone`.
    pub fn cores_in_zone(&self, zone: usize) -> usize {
        self.nodes
            .get(zone)
            .map(|n| (n.cpus().count() / self.threads_per_core).max(1))
            .unwrap_or(0)
    }

    /// Returns whether this topology was read from a NUMA-capable system.
    #[inline]
    pub fn is_numa_available(&self) -> bool {
        self.numa_available
    }

    /// Gets a node by ID.
    pub fn node(&self, id: u32) -> Option<&NumaNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Gets the node backing zone `zone`.
    #[inline]
    pub fn zone(&self, zone: usize) -> Option<&NumaNode> {
        self.nodes.get(zone)
    }

    /// Returns an iterator over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &NumaNode> {
        self.nodes.iter()
    }

    /// Returns the zone index containing `cpu`.
    pub fn zone_of_cpu(&self, cpu: usize) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.cpus().contains(cpu as u32))
    }

    /// Gets the current node for the calling thread.
    pub fn current_node(&self) -> NodeId {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: sched_getcpu has no preconditions
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 {
                if let Some(zone) = self.zone_of_cpu(cpu as usize) {
                    return NodeId(self.nodes[zone].id());
                }
            }
        }

        NodeId(self.nodes.first().map(|n| n.id()).unwrap_or(0))
    }
}
