//! Execution state models

use crate::core::context::ExecutionContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Overall execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, first step not yet enqueued
    Pending,
    /// First step message enqueued
    Queued,
    /// At least one step has been dispatched
    Running,
    /// Step messages are parked until resumed
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) | (_, Failed) => true,
            (Pending, Queued) => true,
            (Queued, Running) | (Running, Running) | (Running, Completed) => true,
            (Queued | Running, Paused) => true,
            (Paused, Queued | Running) => true,
            // last in-flight step finished while paused
            (Paused, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "PENDING" => ExecutionStatus::Pending,
            "QUEUED" => ExecutionStatus::Queued,
            "RUNNING" => ExecutionStatus::Running,
            "PAUSED" => ExecutionStatus::Paused,
            "COMPLETED" => ExecutionStatus::Completed,
            "FAILED" => ExecutionStatus::Failed,
            "CANCELLED" => ExecutionStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }
}

/// Status of one step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    /// Failed, a retry has been scheduled
    Pending,
    /// Failed with `onError: continue`
    Skipped,
    /// Suspended by a delay, or a merge still waiting on upstream branches
    Waiting,
}

impl StepStatus {
    /// A final entry will not be touched by a redelivery of the same message
    pub fn is_final(self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

/// Record of one step attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub step_id: String,
    pub node_type: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    /// Delivery that produced this entry; redeliveries share it
    pub message_id: Uuid,
}

/// Engine-owned per-node state for nodes that span several dispatches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeState {
    Loop { index: usize, total: usize },
    Delay { resume_at: DateTime<Utc> },
    Merge { fired: bool },
}

/// Unit of work carried by the queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepMessage {
    pub execution_id: Uuid,
    pub step_id: String,
    pub retry_count: u32,
    pub message_id: Uuid,
}

impl StepMessage {
    pub fn new(execution_id: Uuid, step_id: impl Into<String>, retry_count: u32) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            retry_count,
            message_id: Uuid::new_v4(),
        }
    }

    /// The same step again, as a fresh delivery
    pub fn retry(&self) -> Self {
        Self::new(self.execution_id, self.step_id.clone(), self.retry_count + 1)
    }

    /// The same step and attempt, as a fresh delivery
    pub fn redeliver(&self) -> Self {
        Self::new(self.execution_id, self.step_id.clone(), self.retry_count)
    }
}

/// One run of a pipeline against a trigger payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub pipeline_id: String,
    pub pipeline_version: u32,
    pub status: ExecutionStatus,
    pub context: ExecutionContext,
    #[serde(default)]
    pub node_state: BTreeMap<String, NodeState>,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub step_logs: Vec<StepLog>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_step_id: Option<String>,
    /// Step messages enqueued but not yet finalized
    #[serde(default)]
    pub in_flight: u32,
    /// `in_flight` broken down by step id
    #[serde(default)]
    pub outstanding: BTreeMap<String, u32>,
    /// Messages that arrived while paused
    #[serde(default)]
    pub parked: Vec<StepMessage>,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every successful save; the store compares it before writing
    #[serde(default)]
    pub revision: u64,
}

impl Execution {
    /// Create a pending execution
    pub fn new(pipeline_id: &str, pipeline_version: u32, trigger: Value, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: pipeline_id.to_string(),
            pipeline_version,
            status: ExecutionStatus::Pending,
            context: ExecutionContext::new(trigger),
            node_state: BTreeMap::new(),
            current_step_id: None,
            step_logs: Vec::new(),
            error: None,
            error_step_id: None,
            in_flight: 0,
            outstanding: BTreeMap::new(),
            parked: Vec::new(),
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next` if the state machine allows it; returns whether it moved
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.parked.clear();
        }
        self.status = next;
        true
    }

    /// Terminal failure attributed to a step
    pub fn fail(&mut self, error: impl Into<String>, step_id: Option<&str>) -> bool {
        if !self.transition(ExecutionStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        self.error_step_id = step_id.map(str::to_string);
        true
    }

    /// Count a newly enqueued message for `step_id` as in flight
    pub fn track_message(&mut self, step_id: &str) {
        self.in_flight += 1;
        *self.outstanding.entry(step_id.to_string()).or_default() += 1;
    }

    /// A message for `step_id` reached a final outcome
    pub fn finish_message(&mut self, step_id: &str) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(count) = self.outstanding.get_mut(step_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outstanding.remove(step_id);
            }
        }
    }

    /// Status of the most recent log entry for `step_id`
    pub fn latest_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_logs
            .iter()
            .rev()
            .find(|log| log.step_id == step_id)
            .map(|log| log.status)
    }

    /// Log entry written by a given delivery
    pub fn log_for(&self, message: &StepMessage) -> Option<&StepLog> {
        self.step_logs.iter().rev().find(|log| {
            log.message_id == message.message_id
                && log.step_id == message.step_id
                && log.retry_count == message.retry_count
        })
    }

    pub fn log_for_mut(&mut self, message: &StepMessage) -> Option<&mut StepLog> {
        self.step_logs.iter_mut().rev().find(|log| {
            log.message_id == message.message_id
                && log.step_id == message.step_id
                && log.retry_count == message.retry_count
        })
    }

    /// Append a log entry, replacing one already written by the same delivery
    pub fn upsert_log(&mut self, entry: StepLog) {
        let existing = self.step_logs.iter_mut().find(|log| {
            log.message_id == entry.message_id
                && log.step_id == entry.step_id
                && log.retry_count == entry.retry_count
        });
        match existing {
            Some(log) => *log = entry,
            None => self.step_logs.push(entry),
        }
    }

    /// All log entries of one step, in attempt order
    pub fn logs_for_step<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepLog> {
        self.step_logs.iter().filter(move |log| log.step_id == step_id)
    }

    /// Distinct steps with at least one completed attempt
    pub fn completed_steps(&self) -> usize {
        self.step_logs
            .iter()
            .filter(|log| log.status == StepStatus::Completed)
            .map(|log| log.step_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Fraction of graph nodes completed (0.0 to 1.0)
    pub fn progress(&self, total_nodes: usize) -> f64 {
        if total_nodes == 0 {
            return 0.0;
        }
        (self.completed_steps() as f64 / total_nodes as f64).min(1.0)
    }
}
