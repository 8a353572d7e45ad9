//! Command-line interface for bugforge.
//!
//! Provides commands for environment management, episode execution and
//! stored-outcome metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
