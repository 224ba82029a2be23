//! Background usage monitor.
//!
//! Periodically logs the usage counters of every active run so operators can
//! follow long-running runs without subscribing to the broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::run::RunRegistry;

/// A background task that periodically logs per-run usage.
///
/// Spawns a tokio task that wakes every `interval`. Call
/// [`UsageMonitor::stop`] to cancel.
pub struct UsageMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UsageMonitor {
    /// Start logging usage for the runs in `registry` every `interval`.
    pub fn start(registry: Arc<RunRegistry>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let handles = registry.handles();
                if handles.is_empty() {
                    continue;
                }

                for run in handles {
                    let snap = run.usage_snapshot();
                    let utilization = snap
                        .rate_limit_utilization()
                        .map(|u| format!("{:.1}%", u * 100.0))
                        .unwrap_or_else(|| "n/a".to_string());
                    tracing::info!(
                        run_id = %snap.run_id,
                        state = %run.state(),
                        provider = %snap.provider,
                        prompt_units = snap.prompt_units,
                        completion_units = snap.completion_units,
                        total_units = snap.total_units,
                        call_count = snap.call_count,
                        rate_limit_utilization = %utilization,
                        elapsed_secs = (chrono::Utc::now() - run.started_at()).num_seconds(),
                        "Run usage"
                    );
                }
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for UsageMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
