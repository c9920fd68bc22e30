//! Host resource monitoring: periodic sampling, a bounded rolling history,
//! edge-triggered threshold alerts, and point-in-time feasibility checks.

pub mod alerts;
pub mod feasibility;
pub mod gauges;
pub mod history;
pub mod monitor;
pub mod probe;

pub use alerts::AlertEvaluator;
pub use gauges::RuntimeGauges;
pub use history::ResourceHistory;
pub use monitor::{AlertHandler, MonitorSettings, ResourceMonitor};
pub use probe::{HostReading, StaticProbe, SysinfoProbe, SystemProbe};
