//! Test: Failure Handling - onError policies and engine-detected failures

use crate::helpers::*;
use async_trait::async_trait;
use pipeflow::actions::{ActionHandler, ActionInput, ActionRegistry, StepResult};
use pipeflow::core::{ActionError, ExecutionStatus, StepMessage, StepStatus};
use pipeflow::persistence::Store;
use serde_json::json;
use std::time::Duration;

const GUARDED: &str = r#"
id: guarded
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: risky
    type: action.test
    onError: continue
  - id: cleanup
    type: action.ok
edges:
  - { source: start, target: risky }
  - { source: risky, target: cleanup }
"#;

fn failing_then_ok() -> (ActionRegistry, RecordingCapability) {
    let recorder = RecordingCapability::new();
    let mut registry = registry_with(FailingCapability::fatal());
    registry.register_capability("action.ok", recorder.clone());
    (registry, recorder)
}

/// Test that onError continue skips the node and follows its default edge
#[tokio::test]
async fn test_on_error_continue_advances() {
    let (registry, recorder) = failing_then_ok();
    let harness = Harness::new(registry).await;

    let execution = harness.run(GUARDED, json!({})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(step_statuses(&execution, "risky"), vec![StepStatus::Skipped]);
    assert_eq!(
        step_logs(&execution, "risky")[0].error.as_deref(),
        Some("request rejected")
    );
    // A skipped node contributes nothing to the context
    assert!(!execution.context.contains("risky"));
    assert_eq!(recorder.call_count("cleanup"), 1);
    assert!(execution.error.is_none());
}

/// Test that the default policy fails the execution and stops the chain
#[tokio::test]
async fn test_on_error_fail_stops_pipeline() {
    let (registry, recorder) = failing_then_ok();
    let harness = Harness::new(registry).await;

    let execution = harness
        .run(&GUARDED.replace("onError: continue", "onError: fail"), json!({}))
        .await;

    assert_status(&execution, ExecutionStatus::Failed);
    assert_eq!(execution.error_step_id.as_deref(), Some("risky"));
    assert_eq!(recorder.call_count("cleanup"), 0);

    let stats = harness.store.pipeline_stats("guarded").await.unwrap();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.successes, 0);
}

/// Test that a message for a node not in the graph fails the execution
#[tokio::test]
async fn test_unknown_node_fails_execution() {
    let (registry, _) = failing_then_ok();
    let harness = Harness::new(registry).await;
    let pipeline = harness.register_yaml(GUARDED).await;
    let execution_id = harness.start(&pipeline.id, json!({})).await;

    harness
        .engine
        .execute_step(&StepMessage::new(execution_id, "ghost", 0))
        .await
        .unwrap();
    harness.drain().await;

    let execution = harness.execution(execution_id).await;
    assert_status(&execution, ExecutionStatus::Failed);
    assert_eq!(execution.error_step_id.as_deref(), Some("ghost"));
    assert!(execution.error.as_deref().unwrap().contains("node not found"));
    // The queued trigger message was dropped once the execution was terminal
    assert!(step_logs(&execution, "start").is_empty());
}

/// Test that a node type without a handler is a non-retryable failure
#[tokio::test]
async fn test_missing_handler_fails() {
    let yaml = r#"
id: unhandled
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: send
    type: action.email
    retryPolicy:
      maxAttempts: 3
      backoffDelay: 10
edges:
  - { source: start, target: send }
"#;
    let harness = Harness::new(ActionRegistry::with_builtins()).await;
    let execution = harness.run(yaml, json!({})).await;

    assert_status(&execution, ExecutionStatus::Failed);
    assert_eq!(step_statuses(&execution, "send"), vec![StepStatus::Failed]);
    assert!(execution
        .error
        .as_deref()
        .unwrap()
        .contains("no action handler registered for node type 'action.email'"));
}

/// Test that a node exceeding its timeout fails like a transient error
#[tokio::test]
async fn test_timeout_fails_step() {
    let yaml = r#"
id: slow
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: wait
    type: action.test
    timeoutMs: 50
    retryPolicy:
      maxAttempts: 2
      backoffDelay: 10
edges:
  - { source: start, target: wait }
"#;
    let harness = Harness::new(registry_with(SlowCapability::new(Duration::from_secs(5)))).await;
    let execution = harness.run(yaml, json!({})).await;

    assert_status(&execution, ExecutionStatus::Failed);
    assert_eq!(
        step_statuses(&execution, "wait"),
        vec![StepStatus::Pending, StepStatus::Failed]
    );
    assert_eq!(execution.error.as_deref(), Some("timed out after 50ms"));
}

struct PanickingHandler;

#[async_trait]
impl ActionHandler for PanickingHandler {
    async fn execute(&self, _input: ActionInput) -> Result<StepResult, ActionError> {
        panic!("handler bug");
    }
}

/// Test that a panicking handler is contained and recorded as a failure
#[tokio::test]
async fn test_handler_panic_is_a_step_failure() {
    let yaml = r#"
id: buggy
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: boom
    type: action.panic
edges:
  - { source: start, target: boom }
"#;
    let mut registry = ActionRegistry::with_builtins();
    registry.register("action.panic", PanickingHandler);
    let harness = Harness::new(registry).await;

    let execution = harness.run(yaml, json!({})).await;

    assert_status(&execution, ExecutionStatus::Failed);
    assert_eq!(execution.error_step_id.as_deref(), Some("boom"));
    assert!(execution.error.as_deref().unwrap().contains("panicked"));
}

/// Test that an invalid pipeline never creates an execution
#[tokio::test]
async fn test_invalid_pipeline_is_rejected_before_start() {
    let harness = Harness::new(ActionRegistry::with_builtins()).await;
    let pipeline = pipeflow::core::Pipeline {
        id: "broken".to_string(),
        version: 1,
        name: "broken".to_string(),
        nodes: vec![pipeflow::core::Node::new("start", "trigger")],
        edges: vec![pipeflow::core::Edge::new("start", "nowhere")],
        trigger_node_id: "start".to_string(),
    };

    assert!(harness.engine.register_pipeline(&pipeline).await.is_err());
    // Even a definition that bypassed registration is checked at start
    harness.store.save_pipeline(&pipeline).await.unwrap();
    let result = harness
        .engine
        .start_execution("broken", json!({}), Default::default())
        .await;
    assert!(matches!(
        result,
        Err(pipeflow::core::EngineError::Validation(_))
    ));
    assert!(harness.store.list_executions(None, 10).await.unwrap().is_empty());
}
