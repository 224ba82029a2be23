//! runforge: run orchestration with live progress broadcasting.
//!
//! This library launches long-running, blocking pipeline runs on worker threads
//! while the async scheduler keeps serving other requests, bridges the workers'
//! progress callbacks into broadcasts, and tracks metered usage per run.

// Core modules
pub mod bridge;
pub mod broadcast;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod run;
pub mod sources;
pub mod usage;

// Re-export commonly used types
pub use broadcast::{BroadcastHub, BroadcastSink, RunEvent};
pub use error::{BridgeError, BroadcastError, RegistryError};
pub use pipeline::{Orchestrator, OrchestratorConfig, OrchestratorError, Pipeline, PipelineContext, RunOutcome};
pub use run::{CancellationToken, RunRegistry, RunState};
pub use usage::{UsageAccumulator, UsageSnapshot};
