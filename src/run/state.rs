//! Run lifecycle states and the transitions allowed between them.
//!
//! ```text
//! pending ──► running ──► completed
//!    │           ├──────► failed
//!    │           └──────► cancelled
//!    ├──────────────────► failed
//!    └──────────────────► cancelled
//! ```
//!
//! Terminal states are absorbing; no state is reachable twice.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Accepted and registered, worker not yet launched.
    Pending,
    /// Worker is executing the pipeline.
    Running,
    /// Pipeline returned its results.
    Completed,
    /// Pipeline raised an error or the worker died.
    Failed,
    /// Cancellation was observed before a result.
    Cancelled,
}

impl RunState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    /// Check if a transition between two states is allowed.
    pub fn can_transition(self, to: RunState) -> bool {
        match self {
            RunState::Pending => matches!(
                to,
                RunState::Running | RunState::Failed | RunState::Cancelled
            ),
            RunState::Running => to.is_terminal(),
            RunState::Completed | RunState::Failed | RunState::Cancelled => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}
