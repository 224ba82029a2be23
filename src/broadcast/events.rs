//! Broadcast payloads emitted over a run's lifetime.
//!
//! Every payload is a JSON object with a `type` discriminator. Field names are
//! the contract subscribers (dashboards, WebSocket clients) depend on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::UsageSnapshot;

/// Channel research runs are broadcast on.
pub const RESEARCH_CHANNEL: &str = "research";

/// A lifecycle event for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        provider: String,
        /// Pipeline-supplied description of the input (query, sources, ...).
        detail: serde_json::Value,
        started_at: DateTime<Utc>,
    },
    StageStarted {
        run_id: String,
        stage: String,
    },
    StageCompleted {
        run_id: String,
        stage: String,
        summary: String,
    },
    StageFailed {
        run_id: String,
        stage: String,
        error: String,
    },
    TokenUsage(UsageSnapshot),
    RunCompleted {
        run_id: String,
        result_count: usize,
    },
    RunCancelled {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
}

impl RunEvent {
    /// The `type` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::StageStarted { .. } => "stage_started",
            RunEvent::StageCompleted { .. } => "stage_completed",
            RunEvent::StageFailed { .. } => "stage_failed",
            RunEvent::TokenUsage(_) => "token_usage",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunCancelled { .. } => "run_cancelled",
            RunEvent::RunFailed { .. } => "run_failed",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StageStarted { run_id, .. }
            | RunEvent::StageCompleted { run_id, .. }
            | RunEvent::StageFailed { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunCancelled { run_id }
            | RunEvent::RunFailed { run_id, .. } => run_id,
            RunEvent::TokenUsage(snapshot) => &snapshot.run_id,
        }
    }

    /// Whether this event ends the run's broadcast stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::RunCancelled { .. } | RunEvent::RunFailed { .. }
        )
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
