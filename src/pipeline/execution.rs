//! The contract between the orchestrator and the pipeline body it runs.
//!
//! A [`Pipeline`] is synchronous and may block freely: the orchestrator always
//! runs it on a worker thread. Everything it needs from the outside world
//! arrives through the [`PipelineContext`]: the cancellation token to poll, the
//! usage accumulator to report into, and the stage callbacks that surface
//! progress to subscribers.

use std::sync::Arc;

use thiserror::Error;

use crate::run::CancellationToken;
use crate::usage::{UsageAccumulator, UsageSnapshot};

/// One result produced by a pipeline (a structured record such as an idea).
pub type ResultItem = serde_json::Value;

/// Errors a pipeline body can raise.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run observed its cancellation token and stopped early.
    ///
    /// Not a failure: the orchestrator records the run as cancelled.
    #[error("Run was cancelled")]
    Cancelled,

    /// The input cannot be executed.
    #[error("Invalid pipeline input: {0}")]
    InvalidInput(String),

    /// A stage failed in a way that aborts the whole run.
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// Any other failure from the pipeline body.
    #[error("Pipeline failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How a run is metered. Unset fields fall back to the orchestrator defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metering {
    pub provider: Option<String>,
    pub rate_limit: Option<u64>,
}

impl Metering {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, limit: u64) -> Self {
        self.rate_limit = Some(limit);
        self
    }
}

type StageFn = Arc<dyn Fn(&str) + Send + Sync>;
type StageResultFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Progress callbacks handed to the pipeline.
///
/// Each call returns once the corresponding broadcast went out or the bridge
/// timeout elapsed; none of them can fail.
#[derive(Clone)]
pub struct StageCallbacks {
    on_stage_start: StageFn,
    on_stage_complete: StageResultFn,
    on_stage_error: StageResultFn,
}

impl std::fmt::Debug for StageCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCallbacks").finish_non_exhaustive()
    }
}

impl StageCallbacks {
    pub fn new(
        on_stage_start: impl Fn(&str) + Send + Sync + 'static,
        on_stage_complete: impl Fn(&str, &str) + Send + Sync + 'static,
        on_stage_error: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_stage_start: Arc::new(on_stage_start),
            on_stage_complete: Arc::new(on_stage_complete),
            on_stage_error: Arc::new(on_stage_error),
        }
    }

    /// Callbacks that do nothing.
    pub fn silent() -> Self {
        Self::new(|_| {}, |_, _| {}, |_, _| {})
    }

    pub fn stage_started(&self, stage: &str) {
        (self.on_stage_start)(stage)
    }

    pub fn stage_completed(&self, stage: &str, summary: &str) {
        (self.on_stage_complete)(stage, summary)
    }

    pub fn stage_failed(&self, stage: &str, error: &str) {
        (self.on_stage_error)(stage, error)
    }
}

/// Everything a pipeline body receives from the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    run_id: String,
    token: CancellationToken,
    usage: Arc<UsageAccumulator>,
    callbacks: StageCallbacks,
}

impl PipelineContext {
    pub fn new(
        run_id: impl Into<String>,
        token: CancellationToken,
        usage: Arc<UsageAccumulator>,
        callbacks: StageCallbacks,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            token,
            usage,
            callbacks,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_signaled()
    }

    /// Cancellation check-point: call between stages.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Cancelled` once the run has been cancelled.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.token.is_signaled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    pub fn usage(&self) -> &Arc<UsageAccumulator> {
        &self.usage
    }

    pub fn record_usage(&self, prompt_units: u64, completion_units: u64) {
        self.usage.record(prompt_units, completion_units);
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    pub fn callbacks(&self) -> &StageCallbacks {
        &self.callbacks
    }

    pub fn stage_started(&self, stage: &str) {
        self.callbacks.stage_started(stage)
    }

    pub fn stage_completed(&self, stage: &str, summary: &str) {
        self.callbacks.stage_completed(stage, summary)
    }

    pub fn stage_failed(&self, stage: &str, error: &str) {
        self.callbacks.stage_failed(stage, error)
    }
}

/// An opaque, blocking pipeline body.
pub trait Pipeline: Send + Sync + 'static {
    /// Input for a single run.
    type Input: Send + 'static;

    /// Provider and rate limit this run is metered against.
    fn metering(&self, _input: &Self::Input) -> Metering {
        Metering::default()
    }

    /// Description of the input carried in the `run_started` broadcast.
    fn describe(&self, _input: &Self::Input) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Execute the run to completion on the calling (worker) thread.
    ///
    /// Implementations poll [`PipelineContext::checkpoint`] between stages and
    /// return `PipelineError::Cancelled` when it trips.
    fn execute(&self, input: Self::Input, ctx: &PipelineContext) -> Result<Vec<ResultItem>, PipelineError>;
}
