//! Test: Branching - switch routing, loops, fan-out and merges

use crate::helpers::*;
use pipeflow::core::{ExecutionStatus, StepStatus};
use pipeflow::execution::ExecutionEvent;
use serde_json::{json, Value};

const TIERED: &str = r#"
id: tiered
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: route
    type: logic.switch
    inputs:
      value: "{{trigger.tier}}"
      cases:
        gold: vip
        silver: standard
  - id: vip_path
    type: action.test
  - id: standard_path
    type: action.test
  - id: fallback
    type: action.test
edges:
  - { source: start, target: route }
  - { source: route, target: vip_path, sourceHandle: vip }
  - { source: route, target: standard_path, sourceHandle: standard }
  - { source: route, target: fallback }
"#;

/// Test that a switch follows only the matching case
#[tokio::test]
async fn test_switch_routes_to_matching_case() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness.run(TIERED, json!({"tier": "gold"})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(recorder.call_count("vip_path"), 1);
    assert_eq!(recorder.call_count("standard_path"), 0);
    assert_eq!(recorder.call_count("fallback"), 0);
    assert_eq!(
        execution.context.step_output("route").unwrap()["branch"],
        json!("vip")
    );
}

/// Test that an unmatched value takes the default edge
#[tokio::test]
async fn test_switch_falls_back_to_default() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness.run(TIERED, json!({"tier": "bronze"})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(recorder.call_count("fallback"), 1);
    assert_eq!(recorder.call_count("vip_path"), 0);
}

/// Test that a loop runs its body once per item, then completes
#[tokio::test]
async fn test_loop_iterates_items() {
    let yaml = r#"
id: batch
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: each
    type: logic.loop
    inputs:
      items: "{{trigger.items}}"
  - id: body
    type: action.test
    inputs:
      item: "{{each.item}}"
      index: "{{each.index}}"
  - id: done
    type: action.test
    inputs:
      iterations: "{{each.iterations}}"
edges:
  - { source: start, target: each }
  - { source: each, target: body, sourceHandle: iteration }
  - { source: body, target: each }
  - { source: each, target: done, sourceHandle: complete }
"#;
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness.run(yaml, json!({"items": ["a", "b", "c"]})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    let items: Vec<Value> = recorder
        .calls()
        .into_iter()
        .filter(|(id, _)| id == "body")
        .map(|(_, inputs)| inputs["item"].clone())
        .collect();
    assert_eq!(items, vec![json!("a"), json!("b"), json!("c")]);
    assert_eq!(step_logs(&execution, "each").len(), 4);
    assert_eq!(
        recorder.inputs_of("done").unwrap()["iterations"],
        json!(3)
    );
    // Loop position is cleared once the loop completes
    assert!(execution.node_state.is_empty());
}

/// Test that maxIterations caps a loop
#[tokio::test]
async fn test_loop_respects_max_iterations() {
    let yaml = r#"
id: capped
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: each
    type: logic.loop
    inputs:
      items: [1, 2, 3, 4, 5]
      maxIterations: 2
  - id: body
    type: action.test
edges:
  - { source: start, target: each }
  - { source: each, target: body, sourceHandle: iteration }
  - { source: body, target: each }
"#;
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness.run(yaml, json!({})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(recorder.call_count("body"), 2);
    assert_eq!(
        execution.context.step_output("each"),
        Some(&json!({"completed": true, "iterations": 2}))
    );
}

const DIAMOND: &str = r#"
id: diamond
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: left
    type: action.test
    inputs:
      side: left
  - id: right
    type: action.test
    inputs:
      side: right
  - id: join
    type: logic.merge
    inputs:
      mode: all
  - id: done
    type: action.test
    inputs:
      combined: "{{join}}"
edges:
  - { source: start, target: left }
  - { source: start, target: right }
  - { source: left, target: join }
  - { source: right, target: join }
  - { source: join, target: done }
"#;

/// Test that every edge out of a node is followed
#[tokio::test]
async fn test_fan_out_runs_every_branch() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness.run(DIAMOND, json!({})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(recorder.call_count("left"), 1);
    assert_eq!(recorder.call_count("right"), 1);

    let finished = harness
        .events()
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::ExecutionFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

/// Test that an all-mode merge fires once, after both branches
#[tokio::test]
async fn test_merge_all_waits_for_both_branches() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness.run(DIAMOND, json!({})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(
        step_statuses(&execution, "join"),
        vec![StepStatus::Completed, StepStatus::Waiting]
    );
    assert_eq!(recorder.call_count("done"), 1);
    assert_eq!(
        recorder.inputs_of("done").unwrap()["combined"],
        json!({"left": {"side": "left"}, "right": {"side": "right"}})
    );
    assert_eq!(execution.in_flight, 0);
}

/// Test that a passthrough merge fires on every arrival
#[tokio::test]
async fn test_merge_passthrough_fires_per_arrival() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness
        .run(&DIAMOND.replace("mode: all", "mode: passthrough"), json!({}))
        .await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(
        step_statuses(&execution, "join"),
        vec![StepStatus::Completed, StepStatus::Completed]
    );
    assert_eq!(recorder.call_count("done"), 2);
}

const GATED_JOIN: &str = r#"
id: gated-join
triggerNodeId: a
nodes:
  - id: a
    type: trigger
  - id: b
    type: logic.condition
    inputs:
      value: "{{trigger.score}}"
      operator: gt
      compareValue: 0.5
  - id: c
    type: action.test
  - id: d
    type: action.test
  - id: e
    type: logic.merge
    inputs:
      mode: all
  - id: f
    type: action.test
    inputs:
      joined: "{{e}}"
edges:
  - { source: a, target: b }
  - { source: b, target: c, sourceHandle: "true" }
  - { source: b, target: d, sourceHandle: "false" }
  - { source: c, target: e }
  - { source: d, target: e }
  - { source: e, target: f }
"#;

/// Test that an all-mode merge behind a condition does not wait on the branch not taken
#[tokio::test]
async fn test_merge_all_after_condition_fires() {
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness.run(GATED_JOIN, json!({"score": 0.9})).await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(recorder.call_count("d"), 0);
    assert_eq!(step_statuses(&execution, "e"), vec![StepStatus::Completed]);
    assert_eq!(recorder.call_count("f"), 1);
    assert_eq!(recorder.inputs_of("f").unwrap()["joined"], json!({"c": {}}));
    assert!(execution.context.step_output("e").is_some());
    assert!(execution.context.step_output("d").is_none());
    assert!(execution.outstanding.is_empty());
}

/// Test that a merge left waiting on a branch that later dies out still fires
#[tokio::test]
async fn test_merge_all_fires_once_pending_branch_dies_out() {
    let yaml = r#"
id: late-gate
triggerNodeId: start
nodes:
  - id: start
    type: trigger
  - id: pick
    type: logic.condition
    inputs:
      value: "{{trigger.score}}"
      operator: gt
      compareValue: 0.5
  - id: audit
    type: action.test
  - id: recheck
    type: action.test
  - id: gate
    type: logic.condition
    inputs:
      value: "{{trigger.flagged}}"
      compareValue: true
  - id: c
    type: action.test
  - id: d
    type: action.test
  - id: join
    type: logic.merge
    inputs:
      mode: all
  - id: done
    type: action.test
edges:
  - { source: start, target: pick }
  - { source: start, target: audit }
  - { source: audit, target: recheck }
  - { source: recheck, target: gate }
  - { source: pick, target: c, sourceHandle: "true" }
  - { source: pick, target: d, sourceHandle: "false" }
  - { source: gate, target: d, sourceHandle: "true" }
  - { source: c, target: join }
  - { source: d, target: join }
  - { source: join, target: done }
"#;
    let recorder = RecordingCapability::new();
    let harness = Harness::new(registry_with(recorder.clone())).await;

    let execution = harness
        .run(yaml, json!({"score": 0.9, "flagged": false}))
        .await;

    assert_status(&execution, ExecutionStatus::Completed);
    assert_eq!(recorder.call_count("d"), 0);
    // First arrival waits while `gate` could still route to `d`
    assert_eq!(
        step_statuses(&execution, "join"),
        vec![StepStatus::Waiting, StepStatus::Completed]
    );
    assert_eq!(recorder.call_count("done"), 1);
    assert_eq!(execution.in_flight, 0);
}
