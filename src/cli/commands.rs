//! CLI command definitions

use clap::Args;
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML (or JSON) file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Trigger payload as JSON
    #[arg(short, long, value_parser = parse_json)]
    pub trigger: Option<Value>,

    /// Validate only, start nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Queue priority for every step of this execution
    #[arg(long, allow_hyphen_values = true)]
    pub priority: Option<i32>,

    /// Number of concurrent step workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Engine tuning file (concurrency, rate limit, lease)
    #[arg(long)]
    pub engine_config: Option<PathBuf>,

    /// Don't save the execution to history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML (or JSON) file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline id to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show one execution
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    pub execution_id: Uuid,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse a JSON argument
pub fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("Invalid JSON: {}", e))
}
