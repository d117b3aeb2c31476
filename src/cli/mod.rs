//! Command-line interface

pub mod capabilities;
pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, RunCommand, StatusCommand, ValidateCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Queue-driven pipeline runner
#[derive(Debug, Parser, Clone)]
#[command(name = "pipeflow")]
#[command(version)]
#[command(about = "Run typed node-graph pipelines on a work queue", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// SQLite database holding pipelines and execution history
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline until its execution finishes
    Run(RunCommand),

    /// Validate a pipeline definition
    Validate(ValidateCommand),

    /// Show execution history
    History(HistoryCommand),

    /// Show one execution and its step log
    Status(StatusCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
