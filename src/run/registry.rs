//! Registry of live runs.
//!
//! Maps run identifiers to [`RunHandle`]s. The map is touched from the scheduler
//! (registration, cancel requests, usage lookups) and from run drivers finishing
//! on their own, so every access goes through a short critical section that is
//! never held across a broadcast or I/O call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;

use crate::error::RegistryError;
use crate::usage::{UsageAccumulator, UsageSnapshot};

use super::cancellation::CancellationToken;
use super::state::RunState;

/// Live handle for one run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    started_at: DateTime<Utc>,
    token: CancellationToken,
    usage: Arc<UsageAccumulator>,
    state: Mutex<RunState>,
    worker: Mutex<Option<AbortHandle>>,
}

impl RunHandle {
    /// Create a handle in the `pending` state.
    pub fn new(run_id: impl Into<String>, token: CancellationToken, usage: Arc<UsageAccumulator>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            token,
            usage,
            state: Mutex::new(RunState::Pending),
            worker: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn usage(&self) -> &Arc<UsageAccumulator> {
        &self.usage
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    pub fn state(&self) -> RunState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the run to `to`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if `to` is not reachable from the current
    /// state; the state is left untouched.
    pub fn transition(&self, to: RunState) -> Result<RunState, RegistryError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let from = *state;
        if !from.can_transition(to) {
            return Err(RegistryError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        *state = to;
        Ok(from)
    }

    /// Remember the worker so a cancel request can interrupt it if it has not started yet.
    pub fn attach_worker(&self, handle: AbortHandle) {
        *self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Signal cancellation and ask the worker to stop.
    ///
    /// A blocking worker that is already executing keeps running until it polls
    /// the token; aborting only prevents a queued worker from starting.
    pub fn request_cancel(&self) {
        self.token.signal();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            worker.abort();
        }
    }
}

/// Thread-safe map of active runs.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run under its id.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRun` if a run with the same id is already active.
    pub fn register(&self, handle: Arc<RunHandle>) -> Result<(), RegistryError> {
        let mut runs = self.write();
        if runs.contains_key(handle.run_id()) {
            return Err(RegistryError::DuplicateRun(handle.run_id().to_string()));
        }
        runs.insert(handle.run_id().to_string(), handle);
        Ok(())
    }

    /// Look up an active run.
    pub fn lookup(&self, run_id: &str) -> Result<Arc<RunHandle>, RegistryError> {
        self.read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(run_id.to_string()))
    }

    /// Remove a run, returning its handle. Removing an absent id is not an error
    /// for the registry's state; the caller just gets `NotFound` back.
    pub fn remove(&self, run_id: &str) -> Result<Arc<RunHandle>, RegistryError> {
        self.write()
            .remove(run_id)
            .ok_or_else(|| RegistryError::NotFound(run_id.to_string()))
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.read().contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Sorted ids of all active runs.
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Handles of all active runs, cloned out of the lock.
    pub fn handles(&self) -> Vec<Arc<RunHandle>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.runs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
