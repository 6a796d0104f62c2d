//! Thread pinning and NUMA-aware allocation.

use std::io::Read;
use std::path::Path;

use nix::sched::{ sched_getaffinity, sched_setaffinity, CpuSet };
use nix::unistd::{ sysconf, Pid, SysconfVar };

use crate::buffer::ProbeBuffer;
use crate::error::*;

/// Placement capabilities the harness depends on.
///
/// Timing measurements are only meaningful once each role is pinned to its
/// own cpu and its memory is on a known node, so every actor goes through
/// one of these before measuring anything.
pub trait PlacementProvider: Send + Sync {
    /// Pin the calling thread to `cpu`.
    fn bind_thread_to_cpu(&self, cpu: usize) -> Result<()>;

    /// Allocate `size` bytes backed by memory on `node`.
    fn alloc_on_node(&self, size: usize, node: usize) -> Result<ProbeBuffer>;

    /// Release a buffer returned by [`PlacementProvider::alloc_on_node`].
    fn free(&self, buf: ProbeBuffer) {
        drop(buf)
    }

    fn num_cpus(&self) -> usize;
    fn num_numa_nodes(&self) -> usize;

    fn check_cpu(&self, cpu: usize) -> Result<()> {
        let available = self.num_cpus();
        if cpu >= available {
            return Err(Error::InvalidCpu { cpu, available });
        }
        Ok(())
    }

    fn check_node(&self, node: usize) -> Result<()> {
        let available = self.num_numa_nodes();
        if node >= available {
            return Err(Error::InvalidNode { node, available });
        }
        Ok(())
    }
}

/// Placement on the running Linux system.
pub struct SystemPlacement;
impl SystemPlacement {
    const NODE_PATH: &'static str = "/sys/devices/system/node";
    const ISOLATED_PATH: &'static str = "/sys/devices/system/cpu/isolated";
    const NOHZ_PATH: &'static str = "/sys/devices/system/cpu/nohz_full";
    const SMT_PATH: &'static str = "/sys/devices/system/cpu/smt/control";
    const BOOST_PATH: &'static str = "/sys/devices/system/cpu/cpufreq/boost";

    /// `MPOL_BIND` from `<linux/mempolicy.h>`
    const MPOL_BIND: nix::libc::c_long = 2;

    fn read_trimmed(path: impl AsRef<Path>) -> Result<String> {
        let mut f = std::fs::File::open(path)?;
        let mut res = String::new();
        f.read_to_string(&mut res)?;
        Ok(res.trim().to_string())
    }

    /// Return a string describing the set of isolated cores.
    pub fn sysfs_isolated() -> Result<String> {
        let res = Self::read_trimmed(Self::ISOLATED_PATH)?;
        Ok(if res.is_empty() { "disabled".to_string() } else { res })
    }

    /// Return a string describing the set of 'nohz_full' cores.
    pub fn sysfs_nohz() -> Result<String> {
        let res = Self::read_trimmed(Self::NOHZ_PATH)?;
        Ok(if res.is_empty() { "disabled".to_string() } else { res })
    }

    /// Returns true if SMT is enabled.
    pub fn sysfs_smt_enabled() -> Result<bool> {
        Ok(Self::read_trimmed(Self::SMT_PATH)? == "on")
    }

    /// Returns true if cpufreq boost is enabled.
    pub fn sysfs_cpufreq_boost_enabled() -> Result<bool> {
        Ok(Self::read_trimmed(Self::BOOST_PATH)? == "1")
    }

    /// Return the cpulist string (ie. "0-7,16-23") for a NUMA node.
    pub fn sysfs_node_cpulist(node: usize) -> Result<String> {
        Self::read_trimmed(format!("{}/node{}/cpulist", Self::NODE_PATH, node))
    }

    /// Parse a kernel cpulist string into a list of cpu ids.
    pub fn parse_cpulist(s: &str) -> Result<Vec<usize>> {
        let bad = || Error::Config(format!("malformed cpulist '{}'", s));
        let mut res = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: usize = lo.parse().map_err(|_| bad())?;
                    let hi: usize = hi.parse().map_err(|_| bad())?;
                    res.extend(lo..=hi);
                },
                None => res.push(part.parse().map_err(|_| bad())?),
            }
        }
        Ok(res)
    }

    /// Cpus attached to `node`. CXL expanders usually have none.
    pub fn node_cpus(node: usize) -> Result<Vec<usize>> {
        Self::parse_cpulist(&Self::sysfs_node_cpulist(node)?)
    }

    /// Apply an `MPOL_BIND` policy for `node` to the pages of `buf`.
    fn mbind(buf: &ProbeBuffer, node: usize) -> Result<()> {
        let mask: u64 = 1u64.checked_shl(node as u32)
            .ok_or(Error::Config(format!("node {} exceeds nodemask", node)))?;
        let ret = unsafe {
            nix::libc::syscall(nix::libc::SYS_mbind,
                buf.target().addr(),
                buf.len(),
                Self::MPOL_BIND,
                &mask as *const u64,
                u64::BITS as nix::libc::c_ulong,
                0 as nix::libc::c_ulong,
            )
        };
        nix::errno::Errno::result(ret)?;
        Ok(())
    }
}

impl PlacementProvider for SystemPlacement {
    fn bind_thread_to_cpu(&self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        let mut cpuset = CpuSet::new();
        cpuset.set(cpu)?;
        sched_setaffinity(Pid::from_raw(0), &cpuset).map_err(|e| {
            log::error!("couldn't pin to cpu {}: {}", cpu, e.desc());
            Error::Placement(e)
        })?;
        log::debug!("pinned thread to cpu {}", cpu);
        Ok(())
    }

    /// Map an anonymous region, bind it to `node`, then fault every page in.
    ///
    /// If the kernel refuses the memory policy (no NUMA support, or
    /// `CAP_SYS_NICE` restrictions), the pages are instead faulted in while
    /// the caller is temporarily pinned to a cpu on `node`. Cpu-less nodes
    /// have no such fallback and report an error. A single-node machine
    /// just faults the pages in.
    fn alloc_on_node(&self, size: usize, node: usize) -> Result<ProbeBuffer> {
        self.check_node(node)?;
        let mut buf = ProbeBuffer::anonymous(size)
            .map_err(|e| match e {
                Error::Io(source) => Error::Alloc { size, node, source },
                e => e,
            })?;

        match Self::mbind(&buf, node) {
            Ok(()) => buf.prefault(),
            Err(e) => {
                log::warn!("mbind to node {} failed ({}); using first-touch",
                    node, e);
                let cpus = Self::node_cpus(node).unwrap_or_default();
                if cpus.is_empty() && self.num_numa_nodes() == 1 {
                    buf.prefault();
                    buf.set_node(node);
                    return Ok(buf);
                }
                if cpus.is_empty() {
                    return Err(Error::Alloc { size, node,
                        source: std::io::Error::other("node has no cpus"),
                    });
                }
                let saved = sched_getaffinity(Pid::from_raw(0))?;
                let mut cpuset = CpuSet::new();
                for cpu in cpus {
                    cpuset.set(cpu)?;
                }
                sched_setaffinity(Pid::from_raw(0), &cpuset)?;
                buf.prefault();
                sched_setaffinity(Pid::from_raw(0), &saved)?;
            },
        }
        buf.set_node(node);
        log::debug!("allocated {:#x} bytes on node {}", buf.len(), node);
        Ok(buf)
    }

    fn num_cpus(&self) -> usize {
        match sysconf(SysconfVar::_NPROCESSORS_ONLN) {
            Ok(Some(n)) if n > 0 => n as usize,
            _ => 1,
        }
    }

    fn num_numa_nodes(&self) -> usize {
        let Ok(dir) = std::fs::read_dir(Self::NODE_PATH) else { return 1; };
        let count = dir.filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix("node")
                    .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            })
            .count();
        count.max(1)
    }
}

/// A fixed, fictional topology. Binding only validates the cpu id, and
/// allocations are plain anonymous maps tagged with the requested node.
///
/// Useful on machines where pinning is unavailable (containers, CI) and in
/// tests.
#[derive(Clone, Copy, Debug)]
pub struct UnpinnedPlacement {
    pub cpus: usize,
    pub nodes: usize,
}
impl UnpinnedPlacement {
    pub fn new(cpus: usize, nodes: usize) -> Self {
        Self { cpus, nodes }
    }
}
impl PlacementProvider for UnpinnedPlacement {
    fn bind_thread_to_cpu(&self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)
    }

    fn alloc_on_node(&self, size: usize, node: usize) -> Result<ProbeBuffer> {
        self.check_node(node)?;
        let mut buf = ProbeBuffer::anonymous(size)?;
        buf.prefault();
        buf.set_node(node);
        Ok(buf)
    }

    fn num_cpus(&self) -> usize { self.cpus }
    fn num_numa_nodes(&self) -> usize { self.nodes }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpulist() {
        assert_eq!(SystemPlacement::parse_cpulist("0-3,8,10-11").unwrap(),
            vec![0, 1, 2, 3, 8, 10, 11]);
        assert!(SystemPlacement::parse_cpulist("").unwrap().is_empty());
        assert!(SystemPlacement::parse_cpulist("3-x").is_err());
    }

    #[test]
    fn unpinned_bounds() {
        let p = UnpinnedPlacement::new(4, 2);
        assert!(p.bind_thread_to_cpu(3).is_ok());
        assert!(matches!(p.bind_thread_to_cpu(4),
            Err(Error::InvalidCpu { cpu: 4, available: 4 })));
        assert!(matches!(p.alloc_on_node(4096, 2),
            Err(Error::InvalidNode { node: 2, available: 2 })));
        let buf = p.alloc_on_node(4096, 1).unwrap();
        assert_eq!(buf.node(), Some(1));
        p.free(buf);
    }

    #[test]
    fn system_topology() {
        let p = SystemPlacement;
        assert!(p.num_cpus() >= 1);
        assert!(p.num_numa_nodes() >= 1);
    }
}
