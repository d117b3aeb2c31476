//! Built-in trigger and `logic.*` nodes

use crate::actions::{ActionHandler, ActionInput, StateUpdate, StepResult};
use crate::core::condition::{to_number, ConditionOperator};
use crate::core::template::stringify;
use crate::core::{ActionError, NodeState, DEFAULT_HANDLE};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Handle a loop node takes for each item
pub const ITERATION_HANDLE: &str = "iteration";

/// Handle a loop node takes once it has run out of items
pub const COMPLETE_HANDLE: &str = "complete";

/// Passes the trigger payload through
pub struct TriggerHandler;

#[async_trait]
impl ActionHandler for TriggerHandler {
    async fn execute(&self, input: ActionInput) -> Result<StepResult, ActionError> {
        Ok(StepResult::success(input.context.trigger().clone()))
    }
}

/// `logic.condition`: branches `"true"` or `"false"`
pub struct ConditionHandler;

#[async_trait]
impl ActionHandler for ConditionHandler {
    async fn execute(&self, input: ActionInput) -> Result<StepResult, ActionError> {
        let operator = match input.input(&["operator"]) {
            None | Some(Value::Null) => ConditionOperator::Equals,
            Some(Value::String(op)) => op.parse()?,
            Some(other) => {
                return Err(ActionError::InvalidInput(format!(
                    "operator must be a string, got {}",
                    other
                )))
            }
        };

        let value = input.input_or_null(&["value"]);
        let compare = input.input_or_null(&["compareValue", "compare_value"]);
        let condition = operator.evaluate(value, compare)?;
        let branch = if condition { "true" } else { "false" };

        Ok(StepResult::branch(
            json!({"condition": condition, "branch": branch}),
            branch,
        ))
    }
}

/// `logic.switch`: branches to `cases[value]`, or `"default"`
///
/// `cases` is either a mapping from value to handle or a list of values
/// that are their own handles.
pub struct SwitchHandler;

#[async_trait]
impl ActionHandler for SwitchHandler {
    async fn execute(&self, input: ActionInput) -> Result<StepResult, ActionError> {
        let value = input.input_or_null(&["value"]).clone();
        let key = stringify(&value);

        let handle = match input.input(&["cases"]) {
            None | Some(Value::Null) => None,
            Some(Value::Object(cases)) => cases.get(&key).map(stringify),
            Some(Value::Array(cases)) => cases
                .iter()
                .any(|case| stringify(case) == key)
                .then(|| key.clone()),
            Some(other) => {
                return Err(ActionError::InvalidInput(format!(
                    "cases must be a mapping or a list, got {}",
                    other
                )))
            }
        };

        let matched = handle.is_some();
        let branch = handle.unwrap_or_else(|| DEFAULT_HANDLE.to_string());
        Ok(StepResult::branch(
            json!({"matched": matched, "value": value, "branch": branch}),
            branch,
        ))
    }
}

/// `logic.loop`: one dispatch per item, then `"complete"`
///
/// The position is kept in the node's `Loop` state; the body routes back
/// to this node to take the next item.
pub struct LoopHandler;

#[async_trait]
impl ActionHandler for LoopHandler {
    async fn execute(&self, input: ActionInput) -> Result<StepResult, ActionError> {
        let items = match input.input(&["items"]) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(ActionError::InvalidInput(format!(
                    "items must be a list, got {}",
                    other
                )))
            }
        };

        let max_iterations = match input.input(&["maxIterations", "max_iterations"]) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                to_number(value)
                    .filter(|n| *n >= 0.0)
                    .map(|n| n as usize)
                    .ok_or_else(|| {
                        ActionError::InvalidInput(format!(
                            "maxIterations must be a non-negative number, got {}",
                            value
                        ))
                    })?,
            ),
        };

        let total = max_iterations.map_or(items.len(), |max| items.len().min(max));
        let index = match &input.node_state {
            Some(NodeState::Loop { index, .. }) => *index,
            _ => 0,
        };

        if index < total {
            let output = json!({"item": items[index], "index": index, "total": total});
            return Ok(StepResult::branch(output, ITERATION_HANDLE).with_state(
                StateUpdate::Set(NodeState::Loop {
                    index: index + 1,
                    total,
                }),
            ));
        }

        Ok(
            StepResult::branch(json!({"completed": true, "iterations": total}), COMPLETE_HANDLE)
                .with_state(StateUpdate::Clear),
        )
    }
}

/// `logic.merge`: combines upstream outputs into one object
///
/// In the default `passthrough` mode every arrival fires with whatever
/// upstream outputs exist. With `mode: all` the node waits while any
/// upstream branch can still arrive, then fires once. A branch that was
/// never taken does not hold it back.
pub struct MergeHandler;

#[async_trait]
impl ActionHandler for MergeHandler {
    async fn execute(&self, input: ActionInput) -> Result<StepResult, ActionError> {
        let mode = input
            .input(&["mode"])
            .and_then(Value::as_str)
            .unwrap_or("passthrough");

        let wait_for_all = match mode {
            "passthrough" | "first" => false,
            "all" => true,
            other => {
                return Err(ActionError::InvalidInput(format!(
                    "unknown merge mode '{}'",
                    other
                )))
            }
        };

        if wait_for_all {
            if matches!(input.node_state, Some(NodeState::Merge { fired: true })) {
                return Ok(StepResult::Wait {
                    state: StateUpdate::Keep,
                });
            }
            if !input.pending_upstream.is_empty() {
                return Ok(StepResult::Wait {
                    state: StateUpdate::Keep,
                });
            }
        }

        let mut merged: Map<String, Value> = input
            .inputs
            .iter()
            .filter(|(key, _)| key.as_str() != "mode")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for id in &input.upstream {
            if let Some(output) = input.context.step_output(id) {
                merged.insert(id.clone(), output.clone());
            }
        }

        let result = StepResult::success(Value::Object(merged));
        if wait_for_all {
            Ok(result.with_state(StateUpdate::Set(NodeState::Merge { fired: true })))
        } else {
            Ok(result)
        }
    }
}

/// `logic.delay`: waits `delayMs` without holding a worker
///
/// The first dispatch suspends and records when it may resume; the
/// redelivered message then branches `"default"`.
pub struct DelayHandler;

#[async_trait]
impl ActionHandler for DelayHandler {
    async fn execute(&self, input: ActionInput) -> Result<StepResult, ActionError> {
        let delay_ms = match input.input(&["delayMs", "delay_ms"]) {
            None | Some(Value::Null) => 0,
            Some(value) => to_number(value)
                .filter(|n| *n >= 0.0)
                .map(|n| n as u64)
                .ok_or_else(|| {
                    ActionError::InvalidInput(format!(
                        "delayMs must be a non-negative number, got {}",
                        value
                    ))
                })?,
        };

        let now = Utc::now();
        match &input.node_state {
            Some(NodeState::Delay { resume_at }) if *resume_at > now => {
                // Redelivered early; sleep off the remainder
                let remaining = (*resume_at - now).to_std().unwrap_or_default();
                Ok(StepResult::Suspend {
                    delay: remaining,
                    state: StateUpdate::Keep,
                })
            }
            Some(NodeState::Delay { .. }) => {
                Ok(StepResult::success(json!({"delayedMs": delay_ms})).with_state(StateUpdate::Clear))
            }
            _ if delay_ms == 0 => Ok(StepResult::success(json!({"delayedMs": 0}))),
            _ => {
                let delay = Duration::from_millis(delay_ms);
                let resume_at = now + chrono::Duration::milliseconds(delay_ms as i64);
                Ok(StepResult::Suspend {
                    delay,
                    state: StateUpdate::Set(NodeState::Delay { resume_at }),
                })
            }
        }
    }
}
