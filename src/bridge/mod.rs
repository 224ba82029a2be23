//! Cross-context event bridge.
//!
//! Pipeline code runs on blocking worker threads and cannot await anything on
//! the async scheduler. The [`EventBridge`] lets it hand an async action to the
//! scheduler and wait, for a bounded time, until the action finished.
//!
//! # Architecture
//!
//! ```text
//!  worker thread                         scheduler (tokio)
//!  ─────────────                         ─────────────────
//!  Bridged::call(arg)
//!    ├─ send BridgedCall ──► mpsc ──► consumer loop
//!    │                                  └─ action.await
//!    └─ recv_timeout(done) ◄─ sync_channel ◄─┘
//! ```
//!
//! A single consumer drains the queue in arrival order, so calls made by one
//! worker thread are executed in the order it made them. Calls from different
//! threads interleave in whatever order they reach the queue.
//!
//! Failures never propagate to the worker: [`Bridged::call`] logs a warning on
//! timeout, on a closed scheduler, or when the action itself fails.

use std::fmt::Display;
use std::future::Future;
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken as ShutdownToken;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Default bound on how long a worker waits for a bridged call.
pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(5);

/// A deferred unit of scheduler work queued by a worker.
///
/// Consumed exactly once by the scheduler-side loop.
pub struct BridgedCall {
    label: String,
    action: BoxFuture<'static, Result<(), BridgeError>>,
    done: Option<SyncSender<Result<(), BridgeError>>>,
}

impl BridgedCall {
    fn new<Fut, E>(label: &str, action: Fut, done: Option<SyncSender<Result<(), BridgeError>>>) -> Self
    where
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let owned = label.to_string();
        let action = action
            .map(move |result| {
                result.map_err(|e| BridgeError::ActionFailed {
                    label: owned,
                    message: e.to_string(),
                })
            })
            .boxed();

        Self {
            label: label.to_string(),
            action,
            done,
        }
    }

    async fn execute(self) {
        let result = self.action.await;
        if let Err(e) = &result {
            debug!(label = %self.label, error = %e, "Bridged action failed on scheduler");
        }
        if let Some(done) = self.done {
            // The worker may have timed out and gone away.
            let _ = done.try_send(result);
        }
    }
}

/// Hands async work from worker threads to the scheduler.
///
/// Cheap to clone; all clones feed the same consumer loop.
#[derive(Clone)]
pub struct EventBridge {
    tx: mpsc::UnboundedSender<BridgedCall>,
    timeout: Duration,
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge")
            .field("timeout", &self.timeout)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Owns the scheduler-side consumer loop of an [`EventBridge`].
///
/// Shutting it down drops every queued call; workers still waiting on one
/// observe [`BridgeError::SchedulerClosed`].
pub struct BridgeConsumer {
    shutdown: ShutdownToken,
    handle: JoinHandle<()>,
}

impl BridgeConsumer {
    /// Stop the consumer loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }

    /// Stop the consumer loop without waiting for it.
    pub fn close(self) {
        self.shutdown.cancel();
    }
}

impl EventBridge {
    /// Spawn the consumer loop on the current tokio runtime.
    ///
    /// Must be called from scheduler context.
    pub fn spawn(timeout: Duration) -> (Self, BridgeConsumer) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BridgedCall>();
        let shutdown = ShutdownToken::new();
        let stop = shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let call = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    call = rx.recv() => match call {
                        Some(call) => call,
                        None => break,
                    },
                };
                // An in-flight action is dropped on shutdown; its worker sees SchedulerClosed.
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = call.execute() => {}
                }
            }
            rx.close();
        });

        (Self { tx, timeout }, BridgeConsumer { shutdown, handle })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Schedule `action` on the scheduler and block until it finishes or the
    /// timeout elapses.
    ///
    /// Call only from a worker thread; blocking the scheduler thread here would
    /// stall the consumer loop.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the action did not finish in time, `SchedulerClosed`
    /// if the consumer loop is gone, or `ActionFailed` if the action returned an
    /// error.
    pub fn call<Fut, E>(&self, label: &str, action: Fut) -> Result<(), BridgeError>
    where
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let (done_tx, done_rx) = sync_channel(1);
        self.tx
            .send(BridgedCall::new(label, action, Some(done_tx)))
            .map_err(|_| BridgeError::SchedulerClosed)?;

        match done_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::Timeout {
                label: label.to_string(),
                timeout: self.timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::SchedulerClosed),
        }
    }

    /// Wrap an async action into a callable usable from worker threads.
    pub fn bridge<A, F, Fut, E>(&self, label: &'static str, action: F) -> Bridged<A>
    where
        A: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + 'static,
    {
        let action = Arc::new(move |arg: A| -> BoxFuture<'static, Result<(), String>> {
            action(arg).map(|r| r.map_err(|e| e.to_string())).boxed()
        });

        Bridged {
            label,
            bridge: self.clone(),
            action,
        }
    }
}

/// A worker-side callable produced by [`EventBridge::bridge`].
pub struct Bridged<A> {
    label: &'static str,
    bridge: EventBridge,
    action: Arc<dyn Fn(A) -> BoxFuture<'static, Result<(), String>> + Send + Sync>,
}

impl<A> Clone for Bridged<A> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            bridge: self.bridge.clone(),
            action: self.action.clone(),
        }
    }
}

impl<A> std::fmt::Debug for Bridged<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridged").field("label", &self.label).finish()
    }
}

impl<A: Send + 'static> Bridged<A> {
    /// Run the action on the scheduler, waiting at most the bridge timeout.
    ///
    /// Never fails: errors are logged and counted, then dropped.
    pub fn call(&self, arg: A) {
        if let Err(e) = self.try_call(arg) {
            crate::metrics::record_bridge_failure(e.reason());
            warn!(label = self.label, error = %e, "Bridged call failed");
        }
    }

    /// Like [`call`](Self::call) but returns the error instead of logging it.
    pub fn try_call(&self, arg: A) -> Result<(), BridgeError> {
        self.bridge.call(self.label, (self.action)(arg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_bridged_call_runs_on_scheduler() {
        let (bridge, consumer) = EventBridge::spawn(Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notify = bridge.bridge("record", move |value: u32| {
            let sink = sink.clone();
            async move {
                sink.lock().expect("lock").push(value);
                Ok::<(), BridgeError>(())
            }
        });

        let result = tokio::task::spawn_blocking(move || notify.try_call(7))
            .await
            .expect("worker panicked");
        assert!(result.is_ok());
        assert_eq!(*seen.lock().expect("lock"), vec![7]);

        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_worker_calls_are_fifo() {
        let (bridge, consumer) = EventBridge::spawn(Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notify = bridge.bridge("record", move |value: u32| {
            let sink = sink.clone();
            async move {
                // Later calls finish faster; order must still hold.
                tokio::time::sleep(Duration::from_millis(u64::from(10 - value))).await;
                sink.lock().expect("lock").push(value);
                Ok::<(), BridgeError>(())
            }
        });

        tokio::task::spawn_blocking(move || {
            for i in 0..10 {
                notify.call(i);
            }
        })
        .await
        .expect("worker panicked");

        assert_eq!(*seen.lock().expect("lock"), (0..10).collect::<Vec<_>>());
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_action_times_out_without_panicking() {
        let (bridge, consumer) = EventBridge::spawn(Duration::from_millis(50));
        let slow = bridge.bridge("slow", |_: ()| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<(), BridgeError>(())
        });

        let probe = slow.clone();
        let err = tokio::task::spawn_blocking(move || probe.try_call(()))
            .await
            .expect("worker panicked")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));

        // The swallowing variant returns control to the worker.
        tokio::task::spawn_blocking(move || slow.call(()))
            .await
            .expect("worker panicked");

        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn test_action_error_is_reported_not_raised() {
        let (bridge, consumer) = EventBridge::spawn(Duration::from_secs(1));
        let failing = bridge.bridge("failing", |_: ()| async { Err::<(), _>("sink offline") });

        let probe = failing.clone();
        let err = tokio::task::spawn_blocking(move || probe.try_call(()))
            .await
            .expect("worker panicked")
            .unwrap_err();
        match err {
            BridgeError::ActionFailed { label, message } => {
                assert_eq!(label, "failing");
                assert_eq!(message, "sink offline");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        tokio::task::spawn_blocking(move || failing.call(()))
            .await
            .expect("worker panicked");
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_report_closed() {
        let (bridge, consumer) = EventBridge::spawn(Duration::from_secs(1));
        consumer.shutdown().await;

        let notify = bridge.bridge("late", |_: ()| async { Ok::<(), BridgeError>(()) });
        let err = tokio::task::spawn_blocking(move || notify.try_call(()))
            .await
            .expect("worker panicked")
            .unwrap_err();
        assert_eq!(err, BridgeError::SchedulerClosed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_workers_all_delivered() {
        let (bridge, consumer) = EventBridge::spawn(Duration::from_secs(2));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notify = bridge.bridge("record", move |value: (usize, usize)| {
            let sink = sink.clone();
            async move {
                sink.lock().expect("lock").push(value);
                Ok::<(), BridgeError>(())
            }
        });

        let workers: Vec<_> = (0..4)
            .map(|w| {
                let notify = notify.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..25 {
                        notify.call((w, i));
                    }
                })
            })
            .collect();
        for w in workers {
            w.await.expect("worker panicked");
        }

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 100);
        for w in 0..4 {
            let per_worker: Vec<usize> = seen.iter().filter(|(id, _)| *id == w).map(|(_, i)| *i).collect();
            assert_eq!(per_worker, (0..25).collect::<Vec<_>>());
        }
        drop(seen);
        consumer.shutdown().await;
    }
}
