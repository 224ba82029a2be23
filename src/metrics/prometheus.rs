//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by runforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all runforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished runs, labeled by outcome (completed, failed, cancelled).
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Runs currently registered.
pub static RUNS_ACTIVE: OnceLock<Gauge> = OnceLock::new();

/// Run wall-clock duration in seconds.
pub static RUN_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Metered units, labeled by provider and kind (prompt/completion).
pub static USAGE_UNITS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Bridged calls that did not complete, labeled by reason.
pub static BRIDGE_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at application startup. Recording before initialization is a
/// silent no-op, so library users that do not export metrics pay nothing.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("runforge_runs_total", "Total number of finished runs"),
        &["outcome"],
    )?;

    let runs_active = Gauge::new("runforge_runs_active", "Number of runs currently registered")?;

    let run_duration = Histogram::with_opts(
        HistogramOpts::new("runforge_run_duration_seconds", "Run duration in seconds")
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 180.0, 600.0, 1800.0]),
    )?;

    let usage_units_total = CounterVec::new(
        Opts::new("runforge_usage_units_total", "Total metered units recorded"),
        &["provider", "kind"],
    )?;

    let bridge_failures_total = CounterVec::new(
        Opts::new(
            "runforge_bridge_failures_total",
            "Bridged calls that timed out or failed",
        ),
        &["reason"],
    )?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(runs_active.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(usage_units_total.clone()))?;
    registry.register(Box::new(bridge_failures_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUNS_ACTIVE.set(runs_active);
    let _ = RUN_DURATION.set(run_duration);
    let _ = USAGE_UNITS_TOTAL.set(usage_units_total);
    let _ = BRIDGE_FAILURES_TOTAL.set(bridge_failures_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
