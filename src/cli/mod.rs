//! Command-line interface for jobforge.
//!
//! Provides operator commands for migrations, lease reaping and queue
//! statistics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
