//! Cache-timing side-channel measurements across memory tiers.

pub mod timing;
pub mod buffer;
pub mod error;
pub mod types;
pub mod primitives;
pub mod stats;
pub mod placement;
pub mod config;
pub mod attacker;
pub mod victim;
pub mod observe;
pub mod report;
pub mod orchestrator;

pub use crate::error::{ Error, Result, Role };
pub use crate::types::*;
pub use crate::timing::{ Target, CacheLevel, CACHE_LINE };
pub use crate::buffer::ProbeBuffer;
pub use crate::primitives::{ AttackPrimitives, Threshold };
pub use crate::placement::{ PlacementProvider, SystemPlacement, UnpinnedPlacement };
pub use crate::config::Configuration;
pub use crate::attacker::{ Attacker, AttackBatch };
pub use crate::victim::*;
pub use crate::observe::*;
pub use crate::report::{ ReportSink, CsvSink, JsonSink, TextSink };
pub use crate::orchestrator::*;
