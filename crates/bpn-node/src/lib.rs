//! Node glue: configuration loading, logging setup, and the operational
//! counters exposed to telemetry readers.

pub mod config;
pub mod counters;
pub mod logging;

pub use config::{NodeConfig, StorageSection};
pub use counters::{NodeCounters, NodeCountersSnapshot};
