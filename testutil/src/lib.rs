/// Testing utilities for the FBFT consensus core
///
/// Provides:
/// - Deterministic key seeds and random block identifiers
/// - Proptest strategies for vote delivery order
/// - Fault plans for network simulation (silenced members, duplicate delivery)

pub mod fixtures;
pub mod generators;

pub use fixtures::FaultPlan;
pub use generators::*;
