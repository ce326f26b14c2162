//! Connector sanity harness
//!
//! Orchestrates connector UI sanity tests:
//! - Partitions the selected connectors into parallel lanes
//! - Waits for auxiliary services (cache, database) to become healthy
//! - Runs the external test command once per lane
//! - Merges lane logs and decides pass/fail from the failure marker and
//!   structured per-test outcomes

pub mod aggregator;
pub mod config;
pub mod error;
pub mod invoker;
pub mod lane;
pub mod matrix;
pub mod orchestrator;
pub mod outcome;
pub mod readiness;
pub mod report;
pub mod telemetry;
pub mod trigger;

// Re-export key types
pub use aggregator::{GateVerdict, MarkerMatch, MarkerVerdict, ResultAggregator};
pub use config::{HarnessConfig, Overrides};
pub use error::{HarnessError, HarnessResult};
pub use invoker::LaneInvoker;
pub use lane::{LaneCommand, LaneEnvironment};
pub use matrix::{ConnectorGroup, Matrix, MatrixPartitioner, PartitionStrategy};
pub use orchestrator::{Harness, RunOutcome};
pub use outcome::{TestOutcome, TestStatus};
pub use readiness::{ReadinessGate, ServiceHealth, ServiceSpec};
pub use report::{LaneReport, LaneStatus, RunReport};
pub use telemetry::init_tracing;
pub use trigger::TriggerEvent;
