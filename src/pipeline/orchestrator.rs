//! Run orchestrator.
//!
//! The [`Orchestrator`] owns the lifecycle of every run:
//! - Registration (duplicates are rejected before any worker starts)
//! - Launching the pipeline body on a blocking worker thread
//! - Bridging worker-side stage and usage callbacks to broadcasts
//! - Racing worker completion against cancel requests
//! - Terminal broadcast, state transition and deregistration
//!
//! A run's broadcasts always arrive in this shape on the configured channel:
//!
//! ```text
//! run_started, (stage_* | token_usage)*, [token_usage], run_completed | run_cancelled | run_failed
//! ```
//!
//! The bracketed `token_usage` is the final snapshot, sent when
//! `emit_final_usage` is set. Nothing from the run is broadcast after its
//! terminal event: the run's bridge is shut down first, so late worker
//! callbacks fail fast and are dropped. Usage snapshots never go backwards;
//! a snapshot that reaches the scheduler behind a newer one is skipped.
//!
//! A run whose driving future is dropped, such as an aborted
//! [`spawn_run`](Orchestrator::spawn_run) task or a `start_run` caller that
//! gave up, is still cancelled, announced and deregistered, so its id can be
//! reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeConsumer, Bridged, EventBridge};
use crate::broadcast::{publish, BroadcastSink, RunEvent};
use crate::error::RegistryError;
use crate::metrics;
use crate::run::{CancellationToken, RunHandle, RunRegistry, RunState};
use crate::usage::{UsageAccumulator, UsageSnapshot};

use super::config::OrchestratorConfig;
use super::execution::{Pipeline, PipelineContext, PipelineError, ResultItem, StageCallbacks};

/// Errors surfaced to callers of the run control surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Registration failed, typically because the run id is already active.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The pipeline body raised an error.
    #[error("Run '{run_id}' failed: {source}")]
    Pipeline {
        run_id: String,
        #[source]
        source: PipelineError,
    },

    /// The worker thread panicked.
    #[error("Run '{run_id}' worker panicked: {message}")]
    WorkerPanicked { run_id: String, message: String },
}

impl OrchestratorError {
    /// Message carried by the `run_failed` broadcast.
    fn failure_message(&self) -> String {
        match self {
            OrchestratorError::Pipeline { source, .. } => source.to_string(),
            OrchestratorError::WorkerPanicked { message, .. } => format!("worker panicked: {}", message),
            OrchestratorError::Registry(e) => e.to_string(),
        }
    }
}

/// How a run ended, when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Vec<ResultItem>),
    Cancelled,
}

impl RunOutcome {
    pub fn results(&self) -> Option<&[ResultItem]> {
        match self {
            RunOutcome::Completed(results) => Some(results),
            RunOutcome::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled)
    }
}

enum Termination {
    Completed(Vec<ResultItem>),
    Cancelled,
    Failed(OrchestratorError),
}

impl Termination {
    fn state(&self) -> RunState {
        match self {
            Termination::Completed(_) => RunState::Completed,
            Termination::Cancelled => RunState::Cancelled,
            Termination::Failed(_) => RunState::Failed,
        }
    }
}

/// A run that is registered but not yet driven.
struct PreparedRun<I> {
    guard: RunGuard,
    input: I,
    bridge: EventBridge,
    provider: String,
    detail: serde_json::Value,
}

/// Releases a registered run when its driving future ends, however it ends.
///
/// Deregisters the run and records its outcome. If the run never reached a
/// terminal state, its future was dropped: the run is cancelled and a
/// `run_cancelled` broadcast is spawned on the current runtime.
struct RunGuard {
    handle: Arc<RunHandle>,
    registry: Arc<RunRegistry>,
    sink: Arc<dyn BroadcastSink>,
    channel: String,
    consumer: Option<BridgeConsumer>,
    started: Instant,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let run_id = self.handle.run_id().to_string();
        if let Some(consumer) = self.consumer.take() {
            consumer.close();
        }

        let abandoned = self.handle.transition(RunState::Cancelled).is_ok();
        if abandoned {
            self.handle.request_cancel();
            warn!(run_id = %run_id, "Run dropped before finishing; cancelled");
        }

        if self.registry.remove(&run_id).is_err() {
            debug!(run_id = %run_id, "Run was already deregistered");
        }
        metrics::record_run_finished(&self.handle.state().to_string(), self.started.elapsed());

        if !abandoned {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(run_id = %run_id, "No runtime left to announce the cancellation");
            return;
        };
        let sink = self.sink.clone();
        let channel = self.channel.clone();
        runtime.spawn(async move {
            let event = RunEvent::RunCancelled { run_id };
            if let Err(e) = publish(sink.as_ref(), &channel, &event).await {
                warn!(run_id = %event.run_id(), error = %e, "Broadcast failed");
            }
        });
    }
}

/// Starts, tracks and cancels runs of one pipeline.
///
/// Cheap to clone; clones share the registry, sink and pipeline.
pub struct Orchestrator<P: Pipeline> {
    config: OrchestratorConfig,
    pipeline: Arc<P>,
    sink: Arc<dyn BroadcastSink>,
    registry: Arc<RunRegistry>,
}

impl<P: Pipeline> Clone for Orchestrator<P> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            pipeline: self.pipeline.clone(),
            sink: self.sink.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<P: Pipeline> std::fmt::Debug for Orchestrator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("active_runs", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<P: Pipeline> Orchestrator<P> {
    pub fn new(pipeline: P, sink: Arc<dyn BroadcastSink>, config: OrchestratorConfig) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            sink,
            registry: Arc::new(RunRegistry::new()),
        }
    }

    /// Track runs in an existing registry instead of a private one.
    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Fresh run identifier: the first eight characters of a v4 UUID.
    pub fn generate_run_id() -> String {
        Uuid::new_v4().to_string()[..8].to_string()
    }

    /// Register and drive a run to its terminal state.
    ///
    /// Only the scheduler thread that awaits this future is occupied by
    /// bookkeeping; the pipeline body runs on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns `Registry` if `run_id` is already active (no worker is
    /// launched), or `Pipeline` / `WorkerPanicked` if the run failed.
    /// Cancellation is not an error.
    pub async fn start_run(
        &self,
        run_id: impl Into<String>,
        input: P::Input,
    ) -> Result<RunOutcome, OrchestratorError> {
        let prepared = self.prepare(run_id.into(), input)?;
        self.drive(prepared).await
    }

    /// Register a run now and drive it on a background task.
    ///
    /// # Errors
    ///
    /// Returns `Registry` synchronously if `run_id` is already active.
    pub fn spawn_run(
        &self,
        run_id: impl Into<String>,
        input: P::Input,
    ) -> Result<JoinHandle<Result<RunOutcome, OrchestratorError>>, OrchestratorError> {
        let prepared = self.prepare(run_id.into(), input)?;
        let this = self.clone();
        Ok(tokio::spawn(async move { this.drive(prepared).await }))
    }

    /// Ask a run to stop.
    ///
    /// Returns false if the run is unknown or already terminal. Repeated
    /// requests are harmless; the run still ends with a single `run_cancelled`.
    pub fn cancellation_request(&self, run_id: &str) -> bool {
        let Ok(handle) = self.registry.lookup(run_id) else {
            debug!(run_id, "Cancel requested for unknown run");
            return false;
        };
        if handle.state().is_terminal() {
            return false;
        }

        handle.request_cancel();
        info!(run_id, "Cancellation requested");
        true
    }

    /// Alias of [`cancellation_request`](Self::cancellation_request).
    pub fn cancel_run(&self, run_id: &str) -> bool {
        self.cancellation_request(run_id)
    }

    /// Current usage of an active run.
    pub fn get_usage(&self, run_id: &str) -> Result<UsageSnapshot, RegistryError> {
        self.registry.lookup(run_id).map(|handle| handle.usage_snapshot())
    }

    /// Ids of every active run, sorted.
    pub fn active_runs(&self) -> Vec<String> {
        self.registry.run_ids()
    }

    pub fn run_state(&self, run_id: &str) -> Option<RunState> {
        self.registry.lookup(run_id).ok().map(|handle| handle.state())
    }

    fn prepare(&self, run_id: String, input: P::Input) -> Result<PreparedRun<P::Input>, OrchestratorError> {
        let metering = self.pipeline.metering(&input);
        let provider = metering
            .provider
            .unwrap_or_else(|| self.config.default_provider.clone());
        let rate_limit = metering.rate_limit.or(self.config.default_rate_limit);
        let detail = self.pipeline.describe(&input);

        let (bridge, consumer) = EventBridge::spawn(self.config.bridge_timeout);
        let usage_events = self.usage_events(&bridge);
        let usage = UsageAccumulator::new(run_id.clone(), provider.clone(), rate_limit).with_callback(
            Arc::new(move |snapshot: &UsageSnapshot| {
                usage_events.call(snapshot.clone());
                Ok(())
            }),
        );

        let handle = Arc::new(RunHandle::new(run_id, CancellationToken::new(), Arc::new(usage)));
        if let Err(e) = self.registry.register(handle.clone()) {
            warn!(run_id = %handle.run_id(), "Rejected duplicate run");
            consumer.close();
            return Err(e.into());
        }

        metrics::record_run_started();
        info!(run_id = %handle.run_id(), provider = %provider, "Run registered");

        let guard = RunGuard {
            handle,
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            channel: self.config.channel.clone(),
            consumer: Some(consumer),
            started: Instant::now(),
        };

        Ok(PreparedRun {
            guard,
            input,
            bridge,
            provider,
            detail,
        })
    }

    async fn drive(&self, prepared: PreparedRun<P::Input>) -> Result<RunOutcome, OrchestratorError> {
        let PreparedRun {
            mut guard,
            input,
            bridge,
            provider,
            detail,
        } = prepared;
        let handle = guard.handle.clone();

        if let Err(e) = handle.transition(RunState::Running) {
            warn!(run_id = %handle.run_id(), error = %e, "Unexpected run state at start");
        }
        self.emit(RunEvent::RunStarted {
            run_id: handle.run_id().to_string(),
            provider,
            detail,
            started_at: handle.started_at(),
        })
        .await;

        // Cancelled between registration and launch.
        let termination = if handle.token().is_signaled() {
            Termination::Cancelled
        } else {
            self.execute(&handle, &bridge, input).await
        };

        // Fixed before any terminal broadcast, so a late cancel request sees a finished run.
        if let Err(e) = handle.transition(termination.state()) {
            warn!(run_id = %handle.run_id(), error = %e, "Unexpected run state at finish");
        }

        drop(bridge);
        if let Some(consumer) = guard.consumer.take() {
            consumer.shutdown().await;
        }

        self.finish(&handle, termination).await
    }

    async fn execute(&self, handle: &RunHandle, bridge: &EventBridge, input: P::Input) -> Termination {
        let run_id = handle.run_id().to_string();
        let ctx = PipelineContext::new(
            run_id.clone(),
            handle.token().clone(),
            handle.usage().clone(),
            self.stage_callbacks(bridge, &run_id),
        );

        let pipeline = self.pipeline.clone();
        let mut worker = tokio::task::spawn_blocking(move || pipeline.execute(input, &ctx));
        handle.attach_worker(worker.abort_handle());
        info!(run_id = %run_id, "Run started");

        tokio::select! {
            biased;
            joined = &mut worker => match joined {
                Ok(Ok(results)) => Termination::Completed(results),
                Ok(Err(PipelineError::Cancelled)) => Termination::Cancelled,
                Ok(Err(source)) => Termination::Failed(OrchestratorError::Pipeline { run_id, source }),
                Err(e) if e.is_cancelled() => Termination::Cancelled,
                Err(e) => Termination::Failed(OrchestratorError::WorkerPanicked {
                    run_id,
                    message: panic_message(e),
                }),
            },
            _ = handle.token().signaled() => Termination::Cancelled,
        }
    }

    async fn finish(&self, handle: &RunHandle, termination: Termination) -> Result<RunOutcome, OrchestratorError> {
        let run_id = handle.run_id().to_string();

        if self.config.emit_final_usage {
            self.emit(RunEvent::TokenUsage(handle.usage_snapshot())).await;
        }

        match termination {
            Termination::Completed(results) => {
                info!(run_id = %run_id, result_count = results.len(), "Run completed");
                self.emit(RunEvent::RunCompleted {
                    run_id: run_id.clone(),
                    result_count: results.len(),
                })
                .await;
                Ok(RunOutcome::Completed(results))
            }
            Termination::Cancelled => {
                info!(run_id = %run_id, "Run cancelled");
                self.emit(RunEvent::RunCancelled {
                    run_id: run_id.clone(),
                })
                .await;
                Ok(RunOutcome::Cancelled)
            }
            Termination::Failed(err) => {
                let message = err.failure_message();
                error!(run_id = %run_id, error = %message, "Run failed");
                self.emit(RunEvent::RunFailed {
                    run_id: run_id.clone(),
                    error: message,
                })
                .await;
                Err(err)
            }
        }
    }

    /// Broadcast from scheduler context; failures are logged only.
    async fn emit(&self, event: RunEvent) {
        if let Err(e) = publish(self.sink.as_ref(), &self.config.channel, &event).await {
            warn!(
                run_id = %event.run_id(),
                event = event.kind(),
                error = %e,
                "Broadcast failed"
            );
        }
    }

    /// A worker-callable that broadcasts the event built from its argument.
    fn bridge_events<A, F>(&self, bridge: &EventBridge, label: &'static str, to_event: F) -> Bridged<A>
    where
        A: Send + 'static,
        F: Fn(A) -> RunEvent + Send + Sync + 'static,
    {
        let sink = self.sink.clone();
        let channel = self.config.channel.clone();
        bridge.bridge(label, move |arg: A| {
            let sink = sink.clone();
            let channel = channel.clone();
            let event = to_event(arg);
            async move { publish(sink.as_ref(), &channel, &event).await }
        })
    }

    /// Worker-callable that broadcasts usage snapshots in non-decreasing order.
    ///
    /// Recorders on different threads may enqueue their snapshots out of
    /// order. The consumer runs actions one at a time, so a high-water mark
    /// checked there drops every snapshot older than one already sent.
    fn usage_events(&self, bridge: &EventBridge) -> Bridged<UsageSnapshot> {
        let sink = self.sink.clone();
        let channel = self.config.channel.clone();
        let sent = Arc::new(AtomicU64::new(0));
        bridge.bridge("token_usage", move |snapshot: UsageSnapshot| {
            let sink = sink.clone();
            let channel = channel.clone();
            let sent = sent.clone();
            async move {
                if sent.fetch_max(snapshot.call_count, Ordering::SeqCst) >= snapshot.call_count {
                    debug!(run_id = %snapshot.run_id, call_count = snapshot.call_count, "Skipping stale usage snapshot");
                    return Ok(());
                }
                publish(sink.as_ref(), &channel, &RunEvent::TokenUsage(snapshot)).await
            }
        })
    }

    fn stage_callbacks(&self, bridge: &EventBridge, run_id: &str) -> StageCallbacks {
        let id = run_id.to_string();
        let started = self.bridge_events(bridge, "stage_started", move |stage: String| {
            RunEvent::StageStarted {
                run_id: id.clone(),
                stage,
            }
        });

        let id = run_id.to_string();
        let completed = self.bridge_events(
            bridge,
            "stage_completed",
            move |(stage, summary): (String, String)| RunEvent::StageCompleted {
                run_id: id.clone(),
                stage,
                summary,
            },
        );

        let id = run_id.to_string();
        let failed = self.bridge_events(
            bridge,
            "stage_failed",
            move |(stage, error): (String, String)| RunEvent::StageFailed {
                run_id: id.clone(),
                stage,
                error,
            },
        );

        StageCallbacks::new(
            move |stage| started.call(stage.to_string()),
            move |stage, summary| completed.call((stage.to_string(), summary.to_string())),
            move |stage, error| failed.call((stage.to_string(), error.to_string())),
        )
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}
