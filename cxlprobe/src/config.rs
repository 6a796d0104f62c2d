//! Measurement configuration.

use serde::Serialize;

use crate::error::*;
use crate::placement::PlacementProvider;
use crate::primitives::Threshold;
use crate::types::{ DataPlacement, ThreadPlacement };

/// Configuration consumed by the role actors and the orchestrator.
///
/// Start from [`Configuration::detect`] and adjust with the builder-style
/// setters, then call [`Configuration::validate`] against the same
/// [`PlacementProvider`] before handing it out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Configuration {
    /// Cpu the attacker is pinned to
    pub attacker_cpu: usize,
    /// Cpu the victim is pinned to
    pub victim_cpu: usize,
    /// Cpu used by auxiliary probing threads
    pub probe_cpu: usize,
    /// Cpu used by the realtime monitor
    pub monitor_cpu: usize,

    /// Node backing "normal" memory
    pub numa_node_normal: usize,
    /// Node backing CXL memory
    pub numa_node_cxl: usize,

    pub data_placement: DataPlacement,
    pub thread_placement: ThreadPlacement,

    /// Whether the hardware prefetchers are expected to be enabled.
    /// Recorded with results; the harness doesn't toggle them.
    pub prefetcher_enabled: bool,

    /// Whether the measuring cpus are expected to be isolated (isolcpus).
    /// Recorded with results; the harness doesn't change it.
    pub isolcpus_enabled: bool,

    /// Attack trials per round
    pub iterations: usize,
    /// Untimed trials run before measuring
    pub warmup_iterations: usize,
    /// Samples per latency/observation run
    pub sample_size: usize,

    /// Initial hit/miss threshold in cycles
    pub threshold: u64,
}

impl Configuration {
    pub const DEFAULT_ITERATIONS: usize = 1000;
    pub const DEFAULT_WARMUP: usize = 100;
    pub const DEFAULT_SAMPLE_SIZE: usize = 1000;

    /// Defaults derived from the machine topology.
    ///
    /// The attacker sits on cpu 0 and the victim halfway across the machine
    /// (usually another physical core, or another socket). CXL memory is
    /// assumed to be node 1 when more than one node exists.
    pub fn detect(placement: &dyn PlacementProvider) -> Self {
        let ncpu = placement.num_cpus().max(1);
        let nodes = placement.num_numa_nodes();
        let last = ncpu - 1;
        Self {
            attacker_cpu: 0,
            victim_cpu: (ncpu / 2).min(last),
            probe_cpu: (ncpu / 2 + 1).min(last),
            monitor_cpu: last,
            numa_node_normal: 0,
            numa_node_cxl: if nodes > 1 { 1 } else { 0 },
            data_placement: DataPlacement::NormalNode,
            thread_placement: ThreadPlacement::CrossCore,
            prefetcher_enabled: true,
            isolcpus_enabled: false,
            iterations: Self::DEFAULT_ITERATIONS,
            warmup_iterations: Self::DEFAULT_WARMUP,
            sample_size: Self::DEFAULT_SAMPLE_SIZE,
            threshold: Threshold::DEFAULT,
        }
    }

    /// Settings for runs with many concurrent threads: no isolation,
    /// prefetchers left on.
    pub fn for_multithreading(mut self, threads: usize,
        placement: &dyn PlacementProvider) -> Self
    {
        if threads > placement.num_cpus() {
            log::warn!("{} threads requested but only {} cpus are online",
                threads, placement.num_cpus());
        }
        self.prefetcher_enabled = true;
        self.isolcpus_enabled = false;
        self
    }

    /// Settings for single-threaded runs on an isolated core.
    pub fn for_isolation(mut self) -> Self {
        self.prefetcher_enabled = false;
        self.isolcpus_enabled = true;
        self.thread_placement = ThreadPlacement::SameThread;
        self.victim_cpu = self.attacker_cpu;
        self
    }

    /// The node holding victim data for the configured placement.
    pub fn data_node(&self) -> usize {
        match self.data_placement {
            DataPlacement::CxlMemory => self.numa_node_cxl,
            DataPlacement::NormalNode | DataPlacement::Local => {
                self.numa_node_normal
            },
        }
    }

    /// Check every cpu and node id against `placement`, and that the counts
    /// are usable.
    pub fn validate(&self, placement: &dyn PlacementProvider) -> Result<()> {
        for cpu in [self.attacker_cpu, self.victim_cpu, self.probe_cpu,
            self.monitor_cpu]
        {
            placement.check_cpu(cpu)?;
        }
        placement.check_node(self.numa_node_normal)?;
        placement.check_node(self.numa_node_cxl)?;
        if self.iterations == 0 {
            return Err(Error::Config("iterations must be non-zero".into()));
        }
        if self.sample_size == 0 {
            return Err(Error::Config("sample_size must be non-zero".into()));
        }
        if self.threshold == 0 {
            return Err(Error::InvalidThreshold);
        }
        Ok(())
    }

    /// Print a summary of the configuration.
    pub fn print(&self) {
        println!("[*] configuration:");
        println!("  {:<24}: {}", "attacker cpu", self.attacker_cpu);
        println!("  {:<24}: {}", "victim cpu", self.victim_cpu);
        println!("  {:<24}: {}", "probe cpu", self.probe_cpu);
        println!("  {:<24}: {}", "monitor cpu", self.monitor_cpu);
        println!("  {:<24}: {}", "normal node", self.numa_node_normal);
        println!("  {:<24}: {}", "cxl node", self.numa_node_cxl);
        println!("  {:<24}: {}", "data placement", self.data_placement.name());
        println!("  {:<24}: {}", "thread placement",
            self.thread_placement.name());
        println!("  {:<24}: {}", "prefetcher", self.prefetcher_enabled);
        println!("  {:<24}: {}", "isolcpus", self.isolcpus_enabled);
        println!("  {:<24}: {}", "iterations", self.iterations);
        println!("  {:<24}: {}", "warmup", self.warmup_iterations);
        println!("  {:<24}: {}", "sample size", self.sample_size);
        println!("  {:<24}: {}", "threshold", self.threshold);
    }
}

impl Configuration {
    pub fn attacker_cpu(mut self, x: usize) -> Self {
        self.attacker_cpu = x;
        self
    }
    pub fn victim_cpu(mut self, x: usize) -> Self {
        self.victim_cpu = x;
        self
    }
    pub fn probe_cpu(mut self, x: usize) -> Self {
        self.probe_cpu = x;
        self
    }
    pub fn monitor_cpu(mut self, x: usize) -> Self {
        self.monitor_cpu = x;
        self
    }
    pub fn numa_node_normal(mut self, x: usize) -> Self {
        self.numa_node_normal = x;
        self
    }
    pub fn numa_node_cxl(mut self, x: usize) -> Self {
        self.numa_node_cxl = x;
        self
    }
    pub fn data_placement(mut self, x: DataPlacement) -> Self {
        self.data_placement = x;
        self
    }
    pub fn thread_placement(mut self, x: ThreadPlacement) -> Self {
        self.thread_placement = x;
        self
    }
    pub fn iterations(mut self, x: usize) -> Self {
        self.iterations = x;
        self
    }
    pub fn warmup_iterations(mut self, x: usize) -> Self {
        self.warmup_iterations = x;
        self
    }
    pub fn sample_size(mut self, x: usize) -> Self {
        self.sample_size = x;
        self
    }
    pub fn threshold(mut self, x: u64) -> Self {
        self.threshold = x;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::placement::UnpinnedPlacement;

    #[test]
    fn detected_defaults() {
        let p = UnpinnedPlacement::new(8, 2);
        let cfg = Configuration::detect(&p);
        assert_eq!(cfg.attacker_cpu, 0);
        assert_eq!(cfg.victim_cpu, 4);
        assert_eq!(cfg.probe_cpu, 5);
        assert_eq!(cfg.monitor_cpu, 7);
        assert_eq!(cfg.numa_node_cxl, 1);
        assert_eq!(cfg.iterations, 1000);
        assert!(cfg.validate(&p).is_ok());
    }

    #[test]
    fn single_cpu_single_node() {
        let p = UnpinnedPlacement::new(1, 1);
        let cfg = Configuration::detect(&p);
        assert_eq!(cfg.numa_node_cxl, 0);
        assert!(cfg.validate(&p).is_ok());
    }

    #[test]
    fn rejects_bad_ids() {
        let p = UnpinnedPlacement::new(4, 1);
        let cfg = Configuration::detect(&p);
        assert!(matches!(cfg.victim_cpu(4).validate(&p),
            Err(Error::InvalidCpu { cpu: 4, .. })));
        assert!(matches!(cfg.numa_node_cxl(1).validate(&p),
            Err(Error::InvalidNode { node: 1, .. })));
        assert!(cfg.iterations(0).validate(&p).is_err());
        assert!(matches!(cfg.threshold(0).validate(&p),
            Err(Error::InvalidThreshold)));
    }

    #[test]
    fn presets() {
        let p = UnpinnedPlacement::new(4, 2);
        let cfg = Configuration::detect(&p).attacker_cpu(2).for_isolation();
        assert_eq!(cfg.victim_cpu, 2);
        assert!(cfg.isolcpus_enabled && !cfg.prefetcher_enabled);
        let cfg = cfg.for_multithreading(16, &p);
        assert!(!cfg.isolcpus_enabled && cfg.prefetcher_enabled);
        assert_eq!(cfg.data_placement(DataPlacement::CxlMemory).data_node(), 1);
    }
}
