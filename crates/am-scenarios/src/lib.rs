//! Scenario vocabulary shared by the harness test suites: recording counter
//! sinks, per-run stats, and the verification helpers that turn drained
//! results into pass/fail with a reason.

pub mod checks;
pub mod counters;
pub mod stats;

pub use checks::{verify_delivery, verify_ordered_delivery, verify_send_shapes, CheckResult};
pub use counters::{CounterEvent, RecordingCounters};
pub use stats::{ArcStatsSink, ScenarioStats, StatsSink};
