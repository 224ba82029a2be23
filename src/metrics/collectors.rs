//! Recording helpers for runforge metrics.
//!
//! Each helper is a no-op until [`init_metrics`](super::init_metrics) ran.

use std::time::Duration;

use super::prometheus::{
    BRIDGE_FAILURES_TOTAL, RUNS_ACTIVE, RUNS_TOTAL, RUN_DURATION, USAGE_UNITS_TOTAL,
};

/// A run was registered.
pub fn record_run_started() {
    if let Some(active) = RUNS_ACTIVE.get() {
        active.inc();
    }
}

/// A run reached a terminal state.
///
/// # Arguments
///
/// * `outcome` - Terminal state name (`completed`, `failed`, `cancelled`)
/// * `duration` - Time since the run was registered
pub fn record_run_finished(outcome: &str, duration: Duration) {
    if let Some(active) = RUNS_ACTIVE.get() {
        active.dec();
    }
    if let Some(total) = RUNS_TOTAL.get() {
        total.with_label_values(&[outcome]).inc();
    }
    if let Some(hist) = RUN_DURATION.get() {
        hist.observe(duration.as_secs_f64());
    }

    tracing::trace!(outcome, duration_secs = duration.as_secs_f64(), "Recorded run metric");
}

/// Metered units recorded by a usage accumulator.
pub fn record_usage(provider: &str, prompt_units: u64, completion_units: u64) {
    if let Some(units) = USAGE_UNITS_TOTAL.get() {
        units
            .with_label_values(&[provider, "prompt"])
            .inc_by(prompt_units as f64);
        units
            .with_label_values(&[provider, "completion"])
            .inc_by(completion_units as f64);
    }
}

/// A bridged call did not complete.
pub fn record_bridge_failure(reason: &str) {
    if let Some(failures) = BRIDGE_FAILURES_TOTAL.get() {
        failures.with_label_values(&[reason]).inc();
    }
}
