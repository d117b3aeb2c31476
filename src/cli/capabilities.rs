//! Capabilities registered by the command-line runner

use crate::actions::{ActionInput, Capability};
use crate::core::template::stringify;
use crate::core::ActionError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Node type the runner registers [`CommandCapability`] under
pub const COMMAND_NODE_TYPE: &str = "action.command";

/// Runs a local program for an `action.command` node
///
/// Inputs: `command` (program name or path) and optional `args`. The full
/// resolved input object is written to the program's stdin as JSON. Stdout
/// becomes the node output: parsed as JSON when it is JSON, otherwise
/// `{"stdout": "<text>"}`. A non-zero exit is a retryable failure; the
/// node's `timeoutMs` bounds the run and kills the child when it expires.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandCapability;

#[async_trait]
impl Capability for CommandCapability {
    async fn invoke(&self, input: &ActionInput) -> Result<Value> {
        let program = input
            .input(&["command"])
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::InvalidInput("'command' must be a string".to_string()))?;

        let args: Vec<String> = match input.input(&["args"]) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(stringify).collect(),
            Some(other) => vec![stringify(other)],
        };

        debug!(step_id = %input.node.id, program, ?args, "Spawning command");

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ActionError::fatal(format!("failed to start '{}': {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&Value::Object(input.inputs.clone()))
                .context("Failed to encode command input")?;
            // A program that never reads stdin closes the pipe early
            if let Err(e) = stdin.write_all(&payload).await {
                debug!("Command did not accept stdin: {}", e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for '{}'", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            warn!("{} exited with code {}: {}", program, exit_code, stderr.trim());
            anyhow::bail!("'{}' exited with code {}: {}", program, exit_code, stderr.trim());
        }

        let stdout = String::from_utf8(output.stdout)
            .with_context(|| format!("Failed to decode output of '{}'", program))?;
        Ok(parse_stdout(&stdout))
    }
}

fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "stdout": trimmed }))
}
