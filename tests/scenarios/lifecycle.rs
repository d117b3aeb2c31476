//! Test: Lifecycle - cancel, pause/resume, redelivery and delays

use crate::helpers::*;
use pipeflow::core::{ExecutionStatus, StepMessage, StepStatus};
use pipeflow::execution::{ExecutionEvent, StartOptions, WorkQueue};
use serde_json::json;
use std::time::{Duration, Instant};
use uuid::Uuid;

const CHAIN: &str = r#"
id: chain
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: first
    type: action.test
  - id: second
    type: action.test
edges:
  - { source: start, target: first }
  - { source: first, target: second }
"#;

const NO_WAIT: Duration = Duration::from_millis(10);

/// Receive and handle exactly one message
async fn step_once(harness: &Harness) -> StepMessage {
    let delivery = harness
        .queue
        .receive(NO_WAIT)
        .await
        .unwrap()
        .expect("a message should be ready");
    harness.engine.execute_step(&delivery.message).await.unwrap();
    harness.queue.ack(&delivery).await.unwrap();
    delivery.message
}

async fn started(harness: &Harness) -> Uuid {
    let pipeline = harness.register_yaml(CHAIN).await;
    harness.start(&pipeline.id, json!({})).await
}

/// Test that cancelling before any step runs drops queued messages
#[tokio::test]
async fn test_cancel_before_first_step() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;
    let execution_id = started(&harness).await;

    let status = harness.engine.cancel_execution(execution_id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Cancelled);
    harness.drain().await;

    let execution = harness.execution(execution_id).await;
    assert_status(&execution, ExecutionStatus::Cancelled);
    assert!(execution.step_logs.is_empty());
    assert!(recorder.calls().is_empty());

    // Cancelling again is a no-op
    let again = harness.engine.cancel_execution(execution_id).await.unwrap();
    assert_eq!(again, ExecutionStatus::Cancelled);
    let finished = harness
        .events()
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::ExecutionFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

/// Test that cancelling mid-run stops the chain
#[tokio::test]
async fn test_cancel_mid_run() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;
    let execution_id = started(&harness).await;

    step_once(&harness).await;
    step_once(&harness).await;
    harness.engine.cancel_execution(execution_id).await.unwrap();
    harness.drain().await;

    let execution = harness.execution(execution_id).await;
    assert_status(&execution, ExecutionStatus::Cancelled);
    assert_eq!(recorder.call_count("first"), 1);
    assert_eq!(recorder.call_count("second"), 0);
}

/// Test that messages are parked while paused and replayed on resume
#[tokio::test]
async fn test_pause_and_resume() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;
    let execution_id = started(&harness).await;

    step_once(&harness).await;
    let status = harness.engine.pause_execution(execution_id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Paused);
    harness.drain().await;

    let paused = harness.execution(execution_id).await;
    assert_status(&paused, ExecutionStatus::Paused);
    assert_eq!(paused.parked.len(), 1);
    assert_eq!(paused.parked[0].step_id, "first");
    assert_eq!(recorder.call_count("first"), 0);

    let status = harness.engine.resume_execution(execution_id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Running);
    harness.drain().await;

    let execution = harness.execution(execution_id).await;
    assert_status(&execution, ExecutionStatus::Completed);
    assert!(execution.parked.is_empty());
    assert_eq!(recorder.call_count("second"), 1);
}

/// Test that resuming an execution that never started returns it to the queue state
#[tokio::test]
async fn test_resume_before_start_is_queued() {
    let harness = Harness::new(registry_with(RecordingCapability::new())).await;
    let execution_id = started(&harness).await;

    harness.engine.pause_execution(execution_id).await.unwrap();
    let status = harness.engine.resume_execution(execution_id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Queued);

    // Resuming something that is not paused changes nothing
    let status = harness.engine.resume_execution(execution_id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Queued);

    harness.drain().await;
    assert_status(&harness.execution(execution_id).await, ExecutionStatus::Completed);
}

/// Test that a redelivered message is acknowledged without re-running
#[tokio::test]
async fn test_duplicate_delivery_is_ignored() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;
    let execution_id = started(&harness).await;

    step_once(&harness).await;
    let first = step_once(&harness).await;
    harness.engine.execute_step(&first).await.unwrap();
    harness.drain().await;

    let execution = harness.execution(execution_id).await;
    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(recorder.call_count("first"), 1);
    assert_eq!(recorder.call_count("second"), 1);
    assert_eq!(step_logs(&execution, "first").len(), 1);
}

/// Test that a terminal execution is never modified by later messages
#[tokio::test]
async fn test_terminal_execution_is_immutable() {
    let harness = Harness::new(registry_with(RecordingCapability::new())).await;
    let execution_id = started(&harness).await;
    harness.drain().await;
    let done = harness.execution(execution_id).await;
    assert_status(&done, ExecutionStatus::Completed);

    for step in ["start", "first", "second", "ghost"] {
        harness
            .engine
            .execute_step(&StepMessage::new(execution_id, step, 0))
            .await
            .unwrap();
    }

    assert_eq!(harness.execution(execution_id).await, done);
    assert!(harness.queue.is_empty().await);
}

/// Test that messages for unknown executions are dropped
#[tokio::test]
async fn test_unknown_execution_is_dropped() {
    let harness = Harness::new(registry_with(RecordingCapability::new())).await;
    let result = harness
        .engine
        .execute_step(&StepMessage::new(Uuid::new_v4(), "start", 0))
        .await;
    assert!(result.is_ok());
}

/// Test that a delay node suspends without holding the step
#[tokio::test]
async fn test_delay_node_resumes_after_delay() {
    let yaml = r#"
id: delayed
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: wait
    type: logic.delay
    inputs:
      delayMs: 60
  - id: after
    type: action.test
edges:
  - { source: start, target: wait }
  - { source: wait, target: after }
"#;
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let begun = Instant::now();
    let execution = harness.run(yaml, json!({})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert!(begun.elapsed() >= Duration::from_millis(60));
    let statuses = step_statuses(&execution, "wait");
    assert_eq!(statuses.first(), Some(&StepStatus::Waiting));
    assert_eq!(statuses.last(), Some(&StepStatus::Completed));
    assert_eq!(
        execution.context.step_output("wait"),
        Some(&json!({"delayedMs": 60}))
    );
    assert!(execution.node_state.is_empty());
    assert_eq!(recorder.call_count("after"), 1);
    assert!(harness.events().iter().any(|e| matches!(
        e,
        ExecutionEvent::StepWaiting { resume_after: Some(_), .. }
    )));
}

/// Test that higher-priority executions are delivered first
#[tokio::test]
async fn test_priority_orders_deliveries() {
    let harness = Harness::new(registry_with(RecordingCapability::new())).await;
    let pipeline = harness.register_yaml(CHAIN).await;

    let low = harness
        .engine
        .start_execution(&pipeline.id, json!({}), StartOptions { dry_run: false, priority: Some(0) })
        .await
        .unwrap();
    let high = harness
        .engine
        .start_execution(&pipeline.id, json!({}), StartOptions { dry_run: false, priority: Some(10) })
        .await
        .unwrap();

    let first = step_once(&harness).await;
    assert_eq!(Some(first.execution_id), high.execution_id);

    harness.drain().await;
    for started in [low, high] {
        let execution = harness.execution(started.execution_id.unwrap()).await;
        assert_status(&execution, ExecutionStatus::Completed);
    }
}
