//! Command-line interface for runforge.
//!
//! Provides commands for inspecting configuration and driving simulated
//! research runs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
