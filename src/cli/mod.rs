//! Command-line interface for trainforge.
//!
//! Provides commands for submitting jobs, running hyperparameter studies
//! and printing metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
