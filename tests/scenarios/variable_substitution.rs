//! Test: Variable Substitution - templates resolved against the context

use crate::helpers::*;
use pipeflow::core::ExecutionStatus;
use serde_json::{json, Value};

const PROFILE: &str = r#"
id: profile
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: lookup
    type: action.test
    inputs:
      userId: "{{trigger.user.id}}"
      user: "{{trigger.user}}"
      greeting: "Hi {{trigger.user.name}}!"
      missingWhole: "{{trigger.user.email}}"
      missingPartial: "Mail: {{trigger.user.email}}"
      firstTag: "{{trigger.tags.0}}"
      nested:
        label: "user-{{ trigger.user.id }}"
        list: ["{{trigger.user.name}}", 7]
  - id: report
    type: action.test
    inputs:
      summary: "{{lookup.greeting}} ({{lookup.userId}})"
      active: "{{trigger.user.active}}"
edges:
  - { source: start, target: lookup }
  - { source: lookup, target: report }
"#;

fn trigger() -> Value {
    json!({
        "user": {"id": 42, "name": "Ada", "active": true},
        "tags": ["admin", "ops"]
    })
}

/// Test that a whole-value marker keeps the native type
#[tokio::test]
async fn test_whole_value_keeps_type() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;
    let execution = harness.run(PROFILE, trigger()).await;
    assert_status(&execution, ExecutionStatus::Completed);

    let inputs = recorder.inputs_of("lookup").unwrap();
    assert_eq!(inputs["userId"], json!(42));
    assert_eq!(inputs["user"], json!({"id": 42, "name": "Ada", "active": true}));

    let report = recorder.inputs_of("report").unwrap();
    assert_eq!(report["active"], json!(true));
}

/// Test that embedded markers are rendered into a string
#[tokio::test]
async fn test_partial_value_renders_string() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;
    harness.run(PROFILE, trigger()).await;

    let inputs = recorder.inputs_of("lookup").unwrap();
    assert_eq!(inputs["greeting"], json!("Hi Ada!"));
    assert_eq!(
        inputs["nested"],
        json!({"label": "user-42", "list": ["Ada", 7]})
    );

    // Outputs of earlier steps are addressable by step id
    let report = recorder.inputs_of("report").unwrap();
    assert_eq!(report["summary"], json!("Hi Ada! (42)"));
}

/// Test how misses and array indexing resolve
#[tokio::test]
async fn test_missing_paths() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;
    let execution = harness.run(PROFILE, trigger()).await;
    assert_status(&execution, ExecutionStatus::Completed);

    let inputs = recorder.inputs_of("lookup").unwrap();
    assert_eq!(inputs["missingWhole"], Value::Null);
    assert_eq!(inputs["missingPartial"], json!("Mail: "));
    // Array indexing is not supported and resolves as a miss
    assert_eq!(inputs["firstTag"], Value::Null);
}

/// Test that the resolved inputs are recorded on the step log
#[tokio::test]
async fn test_step_log_records_resolved_input() {
    let harness = Harness::new(registry_with(RecordingCapability::new())).await;
    let execution = harness.run(PROFILE, trigger()).await;

    let log = step_logs(&execution, "lookup")[0];
    let input = log.input.as_ref().unwrap();
    assert_eq!(input["userId"], json!(42));
    assert_eq!(input["greeting"], json!("Hi Ada!"));
    assert_eq!(log.output.as_ref(), execution.context.step_output("lookup"));
}
