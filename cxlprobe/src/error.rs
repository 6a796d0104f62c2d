//! Error types.

use thiserror::Error;

/// The role an actor plays in a trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Attacker,
    Victim,
}
impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attacker => write!(f, "attacker"),
            Self::Victim => write!(f, "victim"),
        }
    }
}

/// Errors returned by the measurement harness.
///
/// Variants fall into three groups:
///
/// - Configuration errors (bad CPU/node ids, using an actor before it was
///   initialized, operations issued in the wrong state). These are fatal to
///   the calling operation and never retried.
/// - Degenerate measurements (statistics over empty or undersized sets).
/// - Unavailable resources (affinity, allocation, thread spawn). These are
///   propagated as-is from the placement layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cpu {cpu} is out of range (system has {available} cpus)")]
    InvalidCpu { cpu: usize, available: usize },

    #[error("numa node {node} is out of range (system has {available} nodes)")]
    InvalidNode { node: usize, available: usize },

    #[error("{0} used before init")]
    NotInitialized(Role),

    #[error("threshold must be non-zero")]
    InvalidThreshold,

    #[error("unknown {kind} '{name}'")]
    UnknownVariant { kind: &'static str, name: String },

    #[error("operation '{op}' is invalid in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("realtime sampling is already running")]
    AlreadyRunning,

    #[error("realtime sampling is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("degenerate measurement: need at least {needed} samples, got {got}")]
    Degenerate { needed: usize, got: usize },

    #[error("sample sets differ in length ({left} vs {right})")]
    LengthMismatch { left: usize, right: usize },

    #[error("placement call failed: {0}")]
    Placement(#[from] nix::Error),

    #[error("couldn't allocate {size:#x} bytes on node {node}: {source}")]
    Alloc {
        size: usize,
        node: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("thread error: {0}")]
    Thread(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::Degenerate`].
    pub fn degenerate(needed: usize, got: usize) -> Self {
        Self::Degenerate { needed, got }
    }

    /// Returns true for errors caused by a misconfigured caller.
    pub fn is_configuration(&self) -> bool {
        matches!(self,
            Self::InvalidCpu { .. } | Self::InvalidNode { .. } |
            Self::NotInitialized(_) | Self::InvalidThreshold |
            Self::UnknownVariant { .. } | Self::InvalidState { .. } |
            Self::AlreadyRunning | Self::NotRunning | Self::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_errors() {
        assert!(Error::NotInitialized(Role::Attacker).is_configuration());
        assert!(Error::InvalidCpu { cpu: 9, available: 4 }.is_configuration());
        assert!(!Error::degenerate(2, 1).is_configuration());
        let msg = Error::NotInitialized(Role::Victim).to_string();
        assert_eq!(msg, "victim used before init");
    }
}
