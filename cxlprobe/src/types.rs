//! Records produced by measurements.

use serde::Serialize;

/// Where victim data lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DataPlacement {
    /// Ordinary DRAM attached to the local socket.
    NormalNode,
    /// Memory exposed through a CXL expander (usually a CPU-less node).
    CxlMemory,
    /// Memory owned by the measuring thread itself.
    Local,
}
impl DataPlacement {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NormalNode => "normal_node",
            Self::CxlMemory => "cxl_memory",
            Self::Local => "local",
        }
    }
}

/// How the attacker and victim threads are arranged on the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPlacement {
    /// Attacker and victim on different physical cores.
    CrossCore,
    /// Different hardware threads of the same core.
    DifferentThread,
    /// Attacker and victim interleaved on one hardware thread.
    SameThread,
}
impl ThreadPlacement {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CrossCore => "cross_core",
            Self::DifferentThread => "different_thread",
            Self::SameThread => "same_thread",
        }
    }
}

/// A single timed access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TimingSample {
    /// Elapsed cycles for the access
    pub cycle_count: u64,
    /// The cpu which took the sample
    pub cpu_id: u32,
    /// Counter value when the sample was taken
    pub timestamp: u64,
}

/// The outcome of a single attack trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AttackResult {
    pub attack_id: u64,
    /// Victim-side latency (or a warm baseline when the victim is passive)
    pub victim_access_time: u64,
    /// Latency observed by the attacker's probe
    pub attacker_probe_time: u64,
    /// Distance between the probe latency and the threshold
    pub latency_diff: u64,
    pub hit_count: u32,
    pub miss_count: u32,
    pub is_hit: bool,
    pub data_location: DataPlacement,
    pub thread_config: ThreadPlacement,
}
