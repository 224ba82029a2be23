//! Metered usage tracking.
//!
//! - [`UsageAccumulator`]: per-run counters with a snapshot-on-update hook
//! - [`UsageMonitor`]: periodic structured-log reporting of active runs

pub mod accumulator;
pub mod monitor;

pub use accumulator::{UsageAccumulator, UsageCallback, UsageSnapshot};
pub use monitor::UsageMonitor;
