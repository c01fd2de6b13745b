//! Scenario harness for the weft concurrency toolkit.
//!
//! Drives end-to-end workloads against `weft-core` and collects the results
//! as structured, serializable reports. The harness owns observability: the
//! core library itself emits nothing.

pub mod report;
pub mod scenarios;

pub use report::{ScenarioCase, ScenarioReport};
