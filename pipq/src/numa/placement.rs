//! Thread placement: which zone and CPU a thread id runs on.
//!
//! A [`CpuPolicy`] maps a dense thread id to a zone and, unless the OS is
//! left in charge, a CPU. An explicit [`CpuBinding`] list overrides the
//! policy's CPU choice; the zone then follows from the topology.
//!
//! ```text
//! uniform(2 zones, 2 cores, 2 threads/core), CPUs zone0 = 0 2 4 6, zone1 = 1 3 5 7
//!
//!   tid         0  1  2  3  4  5  6  7
//!   f1   cpu    0  2  4  6  1  3  5  7
//!   f1hl cpu    0  2  1  3  4  6  5  7
//!   rr   cpu    0  1  2  3  4  5  6  7
//! ```

use core::fmt;
use core::str::FromStr;

use super::{parse_cpu_list, NumaError, NumaTopology, Result};
use crate::Error;

/// Thread layout policy across NUMA zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuPolicy {
    /// No pinning; threads are spread over zones by `tid % zones`.
    OperatingSystem,
    /// Fill every hardware thread of one zone before moving to the next.
    #[default]
    FillOne,
    /// Fill the physical cores of each zone in turn, hyperthreads last.
    FillOneHyperthreadLast,
    /// Alternate zones thread by thread.
    RoundRobin,
}

impl CpuPolicy {
    /// All policies, in their numeric order.
    pub const ALL: [CpuPolicy; 4] = [
        CpuPolicy::OperatingSystem,
        CpuPolicy::FillOne,
        CpuPolicy::FillOneHyperthreadLast,
        CpuPolicy::RoundRobin,
    ];

    /// Short name accepted by [`FromStr`].
    pub fn abbreviation(self) -> &'static str {
        match self {
            CpuPolicy::OperatingSystem => "os",
            CpuPolicy::FillOne => "f1",
            CpuPolicy::FillOneHyperthreadLast => "f1hl",
            CpuPolicy::RoundRobin => "rr",
        }
    }

    /// Computes the zone and CPU for `tid`.
    pub fn place(self, tid: usize, topology: &NumaTopology) -> Placement {
        let zones = topology.num_nodes().max(1);
        let zone_cpu = |zone: usize, n: usize| topology.zone(zone).and_then(|z| z.nth_cpu(n));

        match self {
            CpuPolicy::OperatingSystem => Placement {
                zone: tid % zones,
                cpu: None,
            },
            CpuPolicy::FillOne => {
                let per_zone = topology.zone(0).map(|z| z.cpus().count()).unwrap_or(1).max(1);
                let zone = (tid / per_zone) % zones;
                Placement {
                    zone,
                    cpu: zone_cpu(zone, tid % per_zone),
                }
            }
            CpuPolicy::FillOneHyperthreadLast => {
                let cores_per_zone = topology.cores_in_zone(0).max(1);
                let num_cores = cores_per_zone * zones;
                let hyperthread = tid / num_cores;
                let rem = tid % num_cores;
                let zone = rem / cores_per_zone;
                Placement {
                    zone,
                    cpu: zone_cpu(zone, rem % cores_per_zone + hyperthread * cores_per_zone),
                }
            }
            CpuPolicy::RoundRobin => {
                let zone = tid % zones;
                Placement {
                    zone,
                    cpu: zone_cpu(zone, tid / zones),
                }
            }
        }
    }
}

impl fmt::Display for CpuPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CpuPolicy::OperatingSystem => "Operating System",
            CpuPolicy::FillOne => "Fill One NUMA Zone (including hyperthreading)",
            CpuPolicy::FillOneHyperthreadLast => "Fill One NUMA Zone (hyperthread last)",
            CpuPolicy::RoundRobin => "Round Robin",
        };
        f.write_str(name)
    }
}

impl FromStr for CpuPolicy {
    type Err = Error;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let by_digit = match s.as_bytes() {
            [d @ b'0'..=b'3'] => Some(CpuPolicy::ALL[(d - b'0') as usize]),
            _ => None,
        };
        by_digit
            .or_else(|| CpuPolicy::ALL.into_iter().find(|p| p.abbreviation() == s))
            .ok_or_else(|| Error::InvalidConfig {
                field: "cpu_policy",
                reason: format!("unknown policy {:?}, expected os|f1|f1hl|rr or 0-3", s),
            })
    }
}

/// An explicit thread-to-CPU list such as `"1,2,3,8-11,4-7,0"`.
///
/// Thread `tid` runs on `cpus[tid % len]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuBinding {
    cpus: Vec<usize>,
}

impl CpuBinding {
    /// Creates a binding from an explicit list.
    pub fn new(cpus: Vec<usize>) -> crate::Result<Self> {
        if cpus.is_empty() {
            return Err(Error::InvalidConfig {
                field: "binding",
                reason: "empty CPU list".into(),
            });
        }
        Ok(Self { cpus })
    }

    /// CPU for thread `tid`.
    #[inline]
    pub fn cpu_for(&self, tid: usize) -> usize {
        self.cpus[tid % self.cpus.len()]
    }

    /// The CPU list in binding order.
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    /// Returns `true` if no CPU appears twice.
    pub fn is_injective(&self) -> bool {
        let mut seen = self.cpus.clone();
        seen.sort_unstable();
        seen.windows(2).all(|w| w[0] != w[1])
    }
}

impl FromStr for CpuBinding {
    type Err = Error;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let cpus = parse_cpu_list(s).ok_or_else(|| Error::InvalidConfig {
            field: "binding",
            reason: format!("malformed CPU list {:?}", s),
        })?;
        Self::new(cpus)
    }
}

/// Where a thread runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Zone index (position in the topology's node list)
    pub zone: usize,
    /// CPU to pin to, if any
    pub cpu: Option<usize>,
}

impl Placement {
    /// Places `tid` by `binding` if given, otherwise by `policy`.
    pub fn resolve(
        tid: usize,
        policy: CpuPolicy,
        binding: Option<&CpuBinding>,
        topology: &NumaTopology,
    ) -> Self {
        match binding {
            Some(binding) => {
                let cpu = binding.cpu_for(tid);
                let zone = topology
                    .zone_of_cpu(cpu)
                    .unwrap_or(tid % topology.num_nodes().max(1));
                Placement {
                    zone,
                    cpu: Some(cpu),
                }
            }
            None => policy.place(tid, topology),
        }
    }
}

/// Pins the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(NumaError::PinFailed {
            cpu,
            errno: libc::EINVAL,
        });
    }
    // SAFETY: cpu_set_t is plain data and cpu is below CPU_SETSIZE
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(NumaError::PinFailed { cpu, errno });
        }
    }
    Ok(())
}

/// Pins the calling thread to `cpu`.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    Err(NumaError::PinFailed { cpu, errno: 0 })
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn cpus_for(policy: CpuPolicy, topology: &NumaTopology, n: usize) -> Vec<Option<usize>> {
        (0..n).map(|tid| policy.place(tid, topology).cpu).collect()
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("os".parse::<CpuPolicy>().unwrap(), CpuPolicy::OperatingSystem);
        assert_eq!("f1".parse::<CpuPolicy>().unwrap(), CpuPolicy::FillOne);
        assert_eq!("f1hl".parse::<CpuPolicy>().unwrap(), CpuPolicy::FillOneHyperthreadLast);
        assert_eq!("3".parse::<CpuPolicy>().unwrap(), CpuPolicy::RoundRobin);
        assert!("4".parse::<CpuPolicy>().is_err());
        assert!("fill".parse::<CpuPolicy>().is_err());
    }

    #[test]
    fn test_fill_one_matches_interleaved_layout() {
        let topology = NumaTopology::uniform(2, 2, 2).unwrap();
        let cpus = cpus_for(CpuPolicy::FillOne, &topology, 8);
        let expected: Vec<_> = [0, 2, 4, 6, 1, 3, 5, 7].into_iter().map(Some).collect();
        assert_eq!(cpus, expected);
        assert_eq!(CpuPolicy::FillOne.place(3, &topology).zone, 0);
        assert_eq!(CpuPolicy::FillOne.place(4, &topology).zone, 1);
    }

    #[test]
    fn test_hyperthread_last() {
        let topology = NumaTopology::uniform(2, 2, 2).unwrap();
        let cpus = cpus_for(CpuPolicy::FillOneHyperthreadLast, &topology, 8);
        let expected: Vec<_> = [0, 2, 1, 3, 4, 6, 5, 7].into_iter().map(Some).collect();
        assert_eq!(cpus, expected);

        let zones: Vec<_> = (0..8)
            .map(|tid| CpuPolicy::FillOneHyperthreadLast.place(tid, &topology).zone)
            .collect();
        assert_eq!(zones, vec![0, 0, 1, 1, 0, 0, 1, 1]);
    }

    #[test]
    fn test_round_robin() {
        let topology = NumaTopology::uniform(2, 2, 2).unwrap();
        let cpus = cpus_for(CpuPolicy::RoundRobin, &topology, 8);
        let expected: Vec<_> = (0..8).map(Some).collect();
        assert_eq!(cpus, expected);
        assert_eq!(CpuPolicy::RoundRobin.place(5, &topology).zone, 1);
    }

    #[test]
    fn test_operating_system_never_pins() {
        let topology = NumaTopology::uniform(4, 1, 1).unwrap();
        let p = CpuPolicy::OperatingSystem.place(6, &topology);
        assert_eq!(p, Placement { zone: 2, cpu: None });
    }

    #[test]
    fn test_binding_overrides_policy() {
        let topology = NumaTopology::uniform(2, 4, 1).unwrap();
        let binding: CpuBinding = "1,2,3,8-11,4-7,0".parse().unwrap();
        assert_eq!(binding.cpus().len(), 12);
        assert!(binding.is_injective());

        let p = Placement::resolve(0, CpuPolicy::FillOne, Some(&binding), &topology);
        assert_eq!(p, Placement { zone: 1, cpu: Some(1) });

        // CPU 8 is outside the topology: zone falls back to tid % zones.
        let p = Placement::resolve(3, CpuPolicy::FillOne, Some(&binding), &topology);
        assert_eq!(p, Placement { zone: 1, cpu: Some(8) });

        let p = Placement::resolve(12, CpuPolicy::FillOne, Some(&binding), &topology);
        assert_eq!(p.cpu, Some(1));
    }

    #[test]
    fn test_bad_binding() {
        assert!("1,,2".parse::<CpuBinding>().is_err());
        assert!(CpuBinding::new(Vec::new()).is_err());
        assert!(!"1,1".parse::<CpuBinding>().unwrap().is_injective());
    }

    #[test]
    fn test_pin_rejects_cpu_beyond_set_size() {
        let err = pin_current_thread(5_000).unwrap_err();
        assert!(matches!(err, NumaError::PinFailed { cpu: 5_000, .. }));
    }
}
