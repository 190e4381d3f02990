//! Command-line interface for stem-forge.
//!
//! Provides commands for running workers, submitting jobs and inspecting
//! job and queue state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
