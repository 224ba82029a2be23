//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks run outcomes, active runs, metered usage and bridge failures.
//!
//! # Example
//!
//! ```ignore
//! use runforge::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run pipelines ...
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{record_bridge_failure, record_run_finished, record_run_started, record_usage};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BRIDGE_FAILURES_TOTAL, REGISTRY, RUNS_ACTIVE, RUNS_TOTAL, RUN_DURATION, USAGE_UNITS_TOTAL,
};
