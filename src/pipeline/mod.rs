//! Run orchestration.
//!
//! # Architecture
//!
//! - **Execution**: the [`Pipeline`] contract and the [`PipelineContext`] a run
//!   body receives
//! - **Orchestrator**: registers runs, launches them on worker threads and turns
//!   their progress into broadcasts
//! - **Research**: a concrete pipeline over pluggable data sources
//! - **Config**: orchestrator settings
//!
//! # Run Flow
//!
//! 1. **Registration**: the run id is claimed in the registry; duplicates fail here
//! 2. **Announcement**: `run_started` is broadcast from the scheduler
//! 3. **Execution**: the pipeline body runs on a blocking worker thread, calling
//!    bridged stage and usage callbacks
//! 4. **Termination**: the first of worker completion, worker failure or a
//!    cancel request decides the terminal broadcast
//! 5. **Cleanup**: state transition, deregistration, metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runforge::broadcast::BroadcastHub;
//! use runforge::pipeline::{Orchestrator, OrchestratorConfig, ResearchInput, ResearchPipeline};
//! use runforge::sources::{SimulatedSource, SourceRegistry};
//!
//! let sources = SourceRegistry::new().with_source(Arc::new(SimulatedSource::new("reddit")));
//! let hub = Arc::new(BroadcastHub::new());
//! let mut events = hub.subscribe("research");
//!
//! let orchestrator = Orchestrator::new(ResearchPipeline::new(sources), hub, OrchestratorConfig::from_env()?);
//! let outcome = orchestrator
//!     .start_run(Orchestrator::<ResearchPipeline>::generate_run_id(), ResearchInput::new("pet care", ["reddit"]))
//!     .await?;
//! ```

pub mod config;
pub mod execution;
pub mod orchestrator;
pub mod research;

// Re-export main types for convenience
pub use config::{ConfigError, OrchestratorConfig};
pub use execution::{Metering, Pipeline, PipelineContext, PipelineError, ResultItem, StageCallbacks};
pub use orchestrator::{Orchestrator, OrchestratorError, RunOutcome};
pub use research::{composite_score, rank_ideas, ResearchInput, ResearchPipeline};
