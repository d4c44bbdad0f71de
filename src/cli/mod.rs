//! CLI module for the Gantry provisioning engine.
//!
//! This module provides the command-line interface for planning, applying
//! and destroying infrastructure.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
