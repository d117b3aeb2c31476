//! Test: Retry Behavior - retry policies and backoff

use crate::helpers::*;
use pipeflow::core::{ExecutionStatus, StepStatus};
use pipeflow::execution::ExecutionEvent;
use serde_json::json;
use std::time::Duration;

fn retry_pipeline(max_attempts: u32, on_error: &str) -> String {
    format!(
        r#"
id: retrying
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: call
    type: action.test
    onError: {on_error}
    retryPolicy:
      maxAttempts: {max_attempts}
      backoffType: exponential
      backoffDelay: 10
  - id: after
    type: action.test
edges:
  - {{ source: start, target: call }}
  - {{ source: call, target: after }}
"#
    )
}

/// Test that an always-failing node gets exactly max_attempts log entries
#[tokio::test]
async fn test_retry_exhaustion_fails_execution() {
    let failing = FailingCapability::retryable();
    let harness = Harness::new(registry_with(failing.clone())).await;

    let execution = harness.run(&retry_pipeline(3, "fail"), json!({})).await;

    assert_status(&execution, ExecutionStatus::Failed);
    assert_eq!(failing.calls(), 3);
    assert_eq!(
        step_statuses(&execution, "call"),
        vec![StepStatus::Pending, StepStatus::Pending, StepStatus::Failed]
    );
    let retry_counts: Vec<u32> = step_logs(&execution, "call")
        .iter()
        .map(|log| log.retry_count)
        .collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    assert_eq!(execution.error_step_id.as_deref(), Some("call"));
    assert_eq!(execution.error.as_deref(), Some("service unavailable"));
    assert!(step_logs(&execution, "after").is_empty());
}

/// Test that a node recovers once the capability stops failing
#[tokio::test]
async fn test_retry_then_success() {
    let flaky = FlakyCapability::new(2);
    let harness = Harness::new(registry_with(flaky.clone())).await;

    let execution = harness.run(&retry_pipeline(3, "fail"), json!({})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(
        step_statuses(&execution, "call"),
        vec![StepStatus::Pending, StepStatus::Pending, StepStatus::Completed]
    );
    // Two calls to "call" failed, the third and the one for "after" succeeded
    assert_eq!(flaky.calls(), 4);
    assert!(execution.context.contains("after"));
}

/// Test that non-retryable failures skip the retry policy
#[tokio::test]
async fn test_non_retryable_failure_is_not_retried() {
    let failing = FailingCapability::fatal();
    let harness = Harness::new(registry_with(failing.clone())).await;

    let execution = harness.run(&retry_pipeline(5, "fail"), json!({})).await;

    assert_status(&execution, ExecutionStatus::Failed);
    assert_eq!(failing.calls(), 1);
    assert_eq!(step_statuses(&execution, "call"), vec![StepStatus::Failed]);
    assert_eq!(execution.error.as_deref(), Some("request rejected"));
}

/// Test that retries are scheduled with exponential backoff
#[tokio::test]
async fn test_retry_events_carry_backoff() {
    let harness = Harness::new(registry_with(FailingCapability::retryable())).await;
    harness.run(&retry_pipeline(3, "fail"), json!({})).await;

    let delays: Vec<(u32, Duration)> = harness
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ExecutionEvent::StepRetryScheduled {
                retry_count, delay, ..
            } => Some((retry_count, delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            (1, Duration::from_millis(10)),
            (2, Duration::from_millis(20))
        ]
    );
}

/// Test that an exhausted retry with onError continue moves on
#[tokio::test]
async fn test_retry_exhaustion_with_continue() {
    let harness = Harness::new(registry_with(FailingCapability::retryable())).await;
    let execution = harness.run(&retry_pipeline(2, "continue"), json!({})).await;

    assert_status(&execution, ExecutionStatus::Failed);
    assert_eq!(
        step_statuses(&execution, "call"),
        vec![StepStatus::Pending, StepStatus::Skipped]
    );
    // "after" uses the same failing capability and has no policy
    assert_eq!(step_statuses(&execution, "after"), vec![StepStatus::Failed]);
    assert_eq!(execution.error_step_id.as_deref(), Some("after"));
}
