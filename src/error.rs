//! Error types for run orchestration.
//!
//! Defines the error types shared across subsystems:
//! - Run registry bookkeeping
//! - Cross-context bridged calls
//! - Broadcast delivery
//!
//! Pipeline, configuration and orchestrator errors live next to the code that
//! raises them.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during run registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Run '{0}' is already active")]
    DuplicateRun(String),

    #[error("Run '{0}' not found")]
    NotFound(String),

    #[error("Invalid state transition for run '{run_id}' from '{from}' to '{to}'")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },
}

/// Errors that can occur while handing work from a worker thread to the scheduler.
///
/// These never reach pipeline code: bridged callables log and swallow them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("Bridged call '{label}' did not finish within {timeout:?}")]
    Timeout { label: String, timeout: Duration },

    #[error("Scheduler side of the bridge is closed")]
    SchedulerClosed,

    #[error("Bridged call '{label}' failed: {message}")]
    ActionFailed { label: String, message: String },
}

impl BridgeError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::SchedulerClosed => "closed",
            BridgeError::ActionFailed { .. } => "action",
        }
    }
}

/// Errors returned by a broadcast sink.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Failed to serialize payload for channel '{channel}': {source}")]
    Serialization {
        channel: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Delivery to channel '{channel}' failed: {message}")]
    Delivery { channel: String, message: String },
}
