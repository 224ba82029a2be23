//! Live progress broadcasting.
//!
//! - [`RunEvent`]: the tagged payloads subscribers receive
//! - [`BroadcastSink`]: the transport seam the orchestrator publishes through
//! - [`BroadcastHub`]: in-process channel fan-out

pub mod events;
pub mod sink;

pub use events::{RunEvent, RESEARCH_CHANNEL};
pub use sink::{publish, BroadcastHub, BroadcastSink};
