//! Command-line interface for convoforge.
//!
//! Provides commands for running the LLM processor over conversation files
//! and for inspecting the resolved configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, ConfigArgs, RunArgs};
