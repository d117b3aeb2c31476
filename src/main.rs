use anyhow::{Context, Result};
use pipeflow::actions::ActionRegistry;
use pipeflow::cli::capabilities::{CommandCapability, COMMAND_NODE_TYPE};
use pipeflow::cli::commands::{HistoryCommand, RunCommand, StatusCommand, ValidateCommand};
use pipeflow::cli::output::*;
use pipeflow::cli::{Cli, Command};
use pipeflow::core::config::{EngineConfig, PipelineConfig};
use pipeflow::core::{ExecutionStatus, StepStatus};
use pipeflow::execution::{ExecutionEngine, InMemoryQueue, StartOptions, WorkQueue, WorkerPool};
use pipeflow::persistence::{InMemoryStore, SqliteStore, Store};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const STATUS_POLL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG applies unless --verbose is given
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, &cli).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::History(cmd) => show_history(cmd, &cli).await?,
        Command::Status(cmd) => show_status(cmd, &cli).await?,
    }

    Ok(())
}

async fn open_store(cli: &Cli) -> Result<SqliteStore> {
    match &cli.database {
        Some(path) => SqliteStore::open(path).await,
        None => SqliteStore::with_default_path().await,
    }
}

async fn run_pipeline(cmd: &RunCommand, cli: &Cli) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline definition")?;
    let pipeline = config.to_pipeline();

    println!(
        "{} Loaded pipeline: {} (version {}, {} nodes)",
        INFO,
        style(&pipeline.name).bold(),
        pipeline.version,
        pipeline.nodes.len()
    );

    let mut engine_config = match &cmd.engine_config {
        Some(path) => EngineConfig::from_file(path).context("Failed to load engine config")?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cmd.workers {
        engine_config.concurrency = workers.max(1);
    }

    // Set up persistence
    let store: Arc<dyn Store> = if cmd.no_history || cmd.dry_run {
        Arc::new(InMemoryStore::new())
    } else {
        Arc::new(open_store(cli).await?)
    };
    let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryQueue::with_lease(Duration::from_millis(
        engine_config.lease_ms,
    )));

    let mut registry = ActionRegistry::with_builtins();
    registry.register_capability(COMMAND_NODE_TYPE, CommandCapability);

    let engine = Arc::new(ExecutionEngine::new(
        store,
        Arc::clone(&queue),
        registry,
        engine_config.clone(),
    ));
    engine
        .add_event_handler(|event| println!("{}", format_execution_event(&event)))
        .await;

    engine
        .register_pipeline(&pipeline)
        .await
        .context("Failed to register pipeline")?;

    let trigger = cmd.trigger.clone().unwrap_or_else(|| json!({}));
    let started = engine
        .start_execution(
            &pipeline.id,
            trigger,
            StartOptions {
                dry_run: cmd.dry_run,
                priority: cmd.priority,
            },
        )
        .await?;

    let Some(execution_id) = started.execution_id else {
        println!("{} Dry run: {} is valid, nothing was executed", CHECK, style(&pipeline.id).bold());
        return Ok(());
    };

    // Run workers until the execution settles
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(Arc::clone(&engine), queue, engine_config);
    let worker_cancel = cancel.clone();
    let workers = tokio::spawn(async move { pool.run(worker_cancel).await });

    let execution = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling execution {}", execution_id);
                engine.cancel_execution(execution_id).await?;
            }
            _ = tokio::time::sleep(STATUS_POLL) => {}
        }
        let execution = engine.execution_status(execution_id).await?;
        if execution.is_terminal() {
            break execution;
        }
    };

    cancel.cancel();
    workers.await.context("Worker pool task panicked")??;

    if !cmd.no_history {
        println!(
            "\n{} Execution saved to history (ID: {})",
            INFO,
            style(execution_id).dim()
        );
    }

    match execution.status {
        ExecutionStatus::Completed => {
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&pipeline.name).bold(),
                style("successfully").green()
            );
            Ok(())
        }
        status => {
            println!(
                "\n{} {} {}",
                CROSS,
                style(&pipeline.name).bold(),
                format_status(status)
            );
            if let Some(error) = &execution.error {
                println!("  {}", style(error).red());
            }
            std::process::exit(1);
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Id: {} (version {})", style(&config.id).bold(), config.version);
            println!("  Nodes: {}", style(config.nodes.len()).cyan());
            println!("  Edges: {}", style(config.edges.len()).cyan());
            println!("  Trigger: {}", style(&config.trigger_node_id).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config.to_pipeline())?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand, cli: &Cli) -> Result<()> {
    let store = open_store(cli).await?;
    let executions = store
        .list_executions(cmd.pipeline.as_deref(), cmd.limit)
        .await?;

    if cmd.json {
        let mut data = json!({ "executions": executions });
        if let Some(pipeline_id) = &cmd.pipeline {
            data["stats"] = serde_json::to_value(store.pipeline_stats(pipeline_id).await?)?;
        }
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
    for summary in &executions {
        println!("  {}", format_execution_summary(summary));
    }

    if let Some(pipeline_id) = &cmd.pipeline {
        let stats = store.pipeline_stats(pipeline_id).await?;
        println!(
            "\n  {} runs: {} succeeded, {} failed",
            style(stats.executions).cyan(),
            style(stats.successes).green(),
            style(stats.failures).red()
        );
    }

    Ok(())
}

async fn show_status(cmd: &StatusCommand, cli: &Cli) -> Result<()> {
    let store = open_store(cli).await?;
    let Some(execution) = store.load_execution(cmd.execution_id).await? else {
        println!("{} Execution not found", WARN);
        std::process::exit(1);
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    let total_nodes = store
        .load_pipeline(&execution.pipeline_id, Some(execution.pipeline_version))
        .await?
        .map_or(0, |pipeline| pipeline.nodes.len());

    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(execution.id).cyan());
    println!(
        "  Pipeline: {} (version {})",
        style(&execution.pipeline_id).bold(),
        execution.pipeline_version
    );
    println!("  Status: {}", format_status(execution.status));
    println!("  Created: {}", style(execution.created_at.to_rfc3339()).dim());
    if let Some(completed) = execution.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(execution.created_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Progress: {} ({}/{})",
        style(format!("{:.0}%", execution.progress(total_nodes) * 100.0)).cyan(),
        execution.completed_steps(),
        total_nodes
    );
    if let Some(error) = &execution.error {
        let step = execution.error_step_id.as_deref().unwrap_or("-");
        println!("  Error ({}): {}", style(step).bold(), style(error).red());
    }

    if !execution.step_logs.is_empty() {
        println!("\n  {}", style("Steps:").bold());
        for log in &execution.step_logs {
            println!("    {}", format_step_log(log));
            if let (StepStatus::Completed, Some(output)) = (log.status, &log.output) {
                let rendered = serde_json::to_string_pretty(output)?;
                for line in format_output(&rendered, 5).lines() {
                    println!("      {}", style(line).dim());
                }
            }
        }
    }

    Ok(())
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
