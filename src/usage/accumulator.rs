//! Thread-safe usage accumulator for a single run.
//!
//! Many uncoordinated callers (pipeline stages, fetchers, model wrappers) report
//! metered consumption through [`UsageAccumulator::record`]. Each call updates the
//! counters under a short critical section and then hands a fresh
//! [`UsageSnapshot`] to the optional update callback with the lock released.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Hook invoked with every new snapshot.
///
/// Failures are logged and swallowed; metering never aborts a pipeline.
pub type UsageCallback = Arc<dyn Fn(&UsageSnapshot) -> anyhow::Result<()> + Send + Sync>;

/// Immutable point-in-time view of a run's accumulated usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub run_id: String,
    pub provider: String,
    pub prompt_units: u64,
    pub completion_units: u64,
    pub total_units: u64,
    pub call_count: u64,
    /// Carried through unmodified; the accumulator never enforces it.
    pub rate_limit: Option<u64>,
}

impl UsageSnapshot {
    /// Fraction of the rate limit consumed, if a limit is configured.
    pub fn rate_limit_utilization(&self) -> Option<f64> {
        match self.rate_limit {
            Some(0) | None => None,
            Some(limit) => Some(self.total_units as f64 / limit as f64),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    prompt_units: u64,
    completion_units: u64,
    total_units: u64,
    call_count: u64,
}

/// Accumulates metered usage for one run.
pub struct UsageAccumulator {
    run_id: String,
    provider: String,
    rate_limit: Option<u64>,
    counters: Mutex<Counters>,
    on_update: Option<UsageCallback>,
}

impl std::fmt::Debug for UsageAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAccumulator")
            .field("run_id", &self.run_id)
            .field("provider", &self.provider)
            .field("rate_limit", &self.rate_limit)
            .field("has_callback", &self.on_update.is_some())
            .finish()
    }
}

impl UsageAccumulator {
    /// Create an accumulator with no update callback.
    pub fn new(run_id: impl Into<String>, provider: impl Into<String>, rate_limit: Option<u64>) -> Self {
        Self {
            run_id: run_id.into(),
            provider: provider.into(),
            rate_limit,
            counters: Mutex::new(Counters::default()),
            on_update: None,
        }
    }

    /// Attach a callback invoked after every `record`.
    pub fn with_callback(mut self, callback: UsageCallback) -> Self {
        self.on_update = Some(callback);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Record consumption from one metered call.
    ///
    /// The callback runs after the counters' lock is released, so a slow
    /// subscriber cannot starve other recorders.
    pub fn record(&self, prompt_units: u64, completion_units: u64) {
        let snapshot = {
            let mut counters = self.lock();
            counters.prompt_units = counters.prompt_units.saturating_add(prompt_units);
            counters.completion_units = counters.completion_units.saturating_add(completion_units);
            counters.total_units = counters
                .total_units
                .saturating_add(prompt_units.saturating_add(completion_units));
            counters.call_count += 1;
            self.to_snapshot(*counters)
        };

        crate::metrics::record_usage(&self.provider, prompt_units, completion_units);

        tracing::debug!(
            run_id = %self.run_id,
            prompt_units,
            completion_units,
            total_units = snapshot.total_units,
            "Recorded usage"
        );

        if let Some(callback) = &self.on_update {
            match catch_unwind(AssertUnwindSafe(|| callback(&snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(run_id = %self.run_id, error = %e, "Usage update callback failed");
                }
                Err(_) => {
                    tracing::warn!(run_id = %self.run_id, "Usage update callback panicked");
                }
            }
        }
    }

    /// Point-in-time read of the counters.
    pub fn snapshot(&self) -> UsageSnapshot {
        let counters = *self.lock();
        self.to_snapshot(counters)
    }

    fn to_snapshot(&self, counters: Counters) -> UsageSnapshot {
        UsageSnapshot {
            run_id: self.run_id.clone(),
            provider: self.provider.clone(),
            prompt_units: counters.prompt_units,
            completion_units: counters.completion_units,
            total_units: counters.total_units,
            call_count: counters.call_count,
            rate_limit: self.rate_limit,
        }
    }

    // Every critical section leaves the counters consistent, so a poisoned
    // lock still guards valid data.
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_new_accumulator_is_empty() {
        let acc = UsageAccumulator::new("r1", "groq", Some(6000));
        let snap = acc.snapshot();
        assert_eq!(snap.run_id, "r1");
        assert_eq!(snap.provider, "groq");
        assert_eq!(snap.total_units, 0);
        assert_eq!(snap.call_count, 0);
        assert_eq!(snap.rate_limit, Some(6000));
    }

    #[test]
    fn test_record_sums_counters() {
        let acc = UsageAccumulator::new("r1", "groq", None);
        let calls = [(100, 20), (0, 0), (7, 3), (1000, 500)];
        for (p, c) in calls {
            acc.record(p, c);
        }

        let snap = acc.snapshot();
        let sum_p: u64 = calls.iter().map(|(p, _)| p).sum();
        let sum_c: u64 = calls.iter().map(|(_, c)| c).sum();
        assert_eq!(snap.prompt_units, sum_p);
        assert_eq!(snap.completion_units, sum_c);
        assert_eq!(snap.total_units, sum_p + sum_c);
        assert_eq!(snap.call_count, calls.len() as u64);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let acc = Arc::new(UsageAccumulator::new("r1", "groq", None));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let acc = acc.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        acc.record(3, 2);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("recorder panicked");
        }

        let snap = acc.snapshot();
        assert_eq!(snap.call_count, 2000);
        assert_eq!(snap.prompt_units, 6000);
        assert_eq!(snap.completion_units, 4000);
        assert_eq!(snap.total_units, snap.prompt_units + snap.completion_units);
    }

    #[test]
    fn test_callback_sees_monotonic_snapshots() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let acc = UsageAccumulator::new("r1", "groq", None).with_callback(Arc::new(move |snap| {
            sink.lock().expect("lock").push(snap.total_units);
            Ok(())
        }));

        acc.record(10, 5);
        acc.record(1, 1);
        acc.record(0, 4);

        let seen = seen.lock().expect("lock");
        assert_eq!(*seen, vec![15, 17, 21]);
    }

    #[test]
    fn test_failing_callback_is_swallowed() {
        let acc = UsageAccumulator::new("r1", "groq", None)
            .with_callback(Arc::new(|_| Err(anyhow::anyhow!("subscriber gone"))));
        acc.record(1, 1);
        acc.record(1, 1);
        assert_eq!(acc.snapshot().call_count, 2);
    }

    #[test]
    fn test_panicking_callback_is_swallowed() {
        let acc = UsageAccumulator::new("r1", "groq", None)
            .with_callback(Arc::new(|_| panic!("subscriber exploded")));
        acc.record(2, 3);
        assert_eq!(acc.snapshot().total_units, 5);
    }

    #[test]
    fn test_callback_runs_without_holding_lock() {
        // A callback that reads the accumulator would deadlock if the lock were held.
        let acc = Arc::new_cyclic(|weak: &std::sync::Weak<UsageAccumulator>| {
            let weak = weak.clone();
            UsageAccumulator::new("r1", "groq", None).with_callback(Arc::new(move |_| {
                if let Some(acc) = weak.upgrade() {
                    let _ = acc.snapshot();
                }
                Ok(())
            }))
        });

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = acc.clone();
        std::thread::spawn(move || {
            worker.record(1, 1);
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(2))
            .expect("record deadlocked while invoking callback");
    }

    #[test]
    fn test_slow_callback_does_not_block_other_recorders() {
        let entered = Arc::new(AtomicUsize::new(0));
        let counter = entered.clone();
        let acc = Arc::new(UsageAccumulator::new("r1", "groq", None).with_callback(Arc::new(
            move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(300));
                }
                Ok(())
            },
        )));

        let slow = acc.clone();
        let handle = std::thread::spawn(move || slow.record(1, 0));
        while entered.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        // The slow callback is still sleeping; counters must stay reachable.
        acc.record(0, 1);
        assert_eq!(acc.snapshot().call_count, 2);
        handle.join().expect("slow recorder panicked");
    }

    #[test]
    fn test_rate_limit_utilization() {
        let acc = UsageAccumulator::new("r1", "groq", Some(100));
        acc.record(30, 20);
        let util = acc.snapshot().rate_limit_utilization().expect("limit set");
        assert!((util - 0.5).abs() < f64::EPSILON);

        let unlimited = UsageAccumulator::new("r2", "ollama", None);
        assert!(unlimited.snapshot().rate_limit_utilization().is_none());
    }
}
