//! Run lifecycle bookkeeping.
//!
//! This module provides:
//! - [`CancellationToken`]: cooperative abort signal shared with the worker
//! - [`RunState`]: the monotonic run state machine
//! - [`RunRegistry`]: the map of live [`RunHandle`]s

pub mod cancellation;
pub mod registry;
pub mod state;

pub use cancellation::CancellationToken;
pub use registry::{RunHandle, RunRegistry};
pub use state::RunState;
