//! CLI output formatting

use crate::core::{ExecutionStatus, StepLog, StepStatus};
use crate::execution::ExecutionEvent;
use crate::persistence::ExecutionSummary;
use console::Emoji;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    let label = status.as_str();
    match status {
        ExecutionStatus::Pending | ExecutionStatus::Queued => style(label).dim().to_string(),
        ExecutionStatus::Running => style(label).yellow().to_string(),
        ExecutionStatus::Paused => style(label).blue().to_string(),
        ExecutionStatus::Completed => style(label).green().to_string(),
        ExecutionStatus::Failed => style(label).red().to_string(),
        ExecutionStatus::Cancelled => style(label).yellow().to_string(),
    }
}

/// Format a step log entry's status for display
pub fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Running => style("running").yellow().to_string(),
        StepStatus::Completed => style("completed").green().to_string(),
        StepStatus::Failed => style("failed").red().to_string(),
        StepStatus::Pending => style("retrying").yellow().to_string(),
        StepStatus::Skipped => style("skipped").dim().to_string(),
        StepStatus::Waiting => style("waiting").blue().to_string(),
    }
}

/// One line per step attempt
pub fn format_step_log(log: &StepLog) -> String {
    let mut line = format!(
        "{} [{}] attempt {} - {}",
        style(&log.step_id).bold(),
        style(&log.node_type).dim(),
        log.retry_count + 1,
        format_step_status(log.status)
    );
    if let Some(error) = &log.error {
        line.push_str(&format!(": {}", style(error).red()));
    }
    line
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running | ExecutionStatus::Queued => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} v{} - {} - {} steps - {}",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline_id).bold(),
        summary.pipeline_version,
        format_status(summary.status),
        style(summary.completed_steps).cyan(),
        style(summary.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::ExecutionStarted {
            execution_id,
            pipeline_id,
        } => format!(
            "{} Starting pipeline {} ({})",
            ROCKET,
            style(pipeline_id).bold(),
            style(short_id(execution_id)).dim()
        ),
        ExecutionEvent::StatusChanged { from, to, .. } => format!(
            "{} {} → {}",
            INFO,
            format_status(*from),
            format_status(*to)
        ),
        ExecutionEvent::StepStarted {
            step_id,
            retry_count,
            ..
        } => {
            if *retry_count > 0 {
                format!(
                    "{} {} (retry {})",
                    SPINNER,
                    style(step_id).cyan(),
                    style(retry_count).dim()
                )
            } else {
                format!("{} {}", SPINNER, style(step_id).cyan())
            }
        }
        ExecutionEvent::StepCompleted {
            step_id,
            handle,
            next_steps,
            ..
        } => {
            if next_steps.is_empty() {
                format!("{} {}", CHECK, style(step_id).green())
            } else {
                format!(
                    "{} {} [{}] → {}",
                    CHECK,
                    style(step_id).green(),
                    style(handle).dim(),
                    style(next_steps.join(", ")).cyan()
                )
            }
        }
        ExecutionEvent::StepFailed { step_id, error, .. } => {
            format!("{} {}: {}", CROSS, style(step_id).red(), style(error).dim())
        }
        ExecutionEvent::StepRetryScheduled {
            step_id,
            retry_count,
            delay,
            ..
        } => format!(
            "{} {} retry {} in {}ms",
            WARN,
            style(step_id).yellow(),
            retry_count,
            delay.as_millis()
        ),
        ExecutionEvent::StepSkipped {
            step_id,
            next_steps,
            ..
        } => format!(
            "{} {} skipped, continuing to {}",
            WARN,
            style(step_id).yellow(),
            style(next_steps.join(", ")).cyan()
        ),
        ExecutionEvent::StepWaiting {
            step_id,
            resume_after,
            ..
        } => match resume_after {
            Some(delay) => format!(
                "{} {} resumes in {}ms",
                SPINNER,
                style(step_id).blue(),
                delay.as_millis()
            ),
            None => format!("{} {} waiting for upstream", SPINNER, style(step_id).blue()),
        },
        ExecutionEvent::ExecutionFinished {
            execution_id,
            status,
            error,
        } => {
            let icon = match status {
                ExecutionStatus::Completed => CHECK,
                ExecutionStatus::Failed => CROSS,
                _ => INFO,
            };
            let mut line = format!(
                "{} Execution ({}) {}",
                icon,
                style(short_id(execution_id)).dim(),
                format_status(*status)
            );
            if let Some(error) = error {
                line.push_str(&format!(": {}", style(error).red()));
            }
            line
        }
    }
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
