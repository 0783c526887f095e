// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Linear success: start → A → B → end.

use super::support::*;
use serde_json::json;

#[tokio::test]
async fn linear_two_step_flow_completes_with_extracted_vars() {
    let stack = stack();
    let id = submit(
        &stack,
        playbook(json!({
            "metadata": {"path": "specs/linear", "name": "linear"},
            "workflow": [
                {"step": "start", "next": [{"then": "a"}]},
                {
                    "step": "a",
                    "tool": {"kind": "python", "value": {"x": 1}},
                    "vars": {"x": "{{ a.x }}"},
                    "next": [{"then": "b"}],
                },
                {"step": "b", "tool": {"kind": "python", "value": "{{ a.x }}"}},
            ],
        })),
    );

    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    // B saw A's result through the render context.
    assert_eq!(state.step_results["b"].render_view(), json!(1));
    assert_eq!(state.variables.get("x"), Some(&json!(1)));

    let types = event_types(&stack, id);
    assert_eq!(
        types,
        vec![
            "execution.started",
            "step.enter",        // a
            "call.started",      // a attempt 1
            "call.done",
            "variable.set",      // x = 1
            "step.exit",         // a → b
            "step.enter",        // b
            "call.started",
            "call.done",
            "step.exit",
            "execution.completed",
        ]
    );
}

#[tokio::test]
async fn submit_payload_overrides_workload_defaults() {
    let stack = stack();
    let pb = playbook(json!({
        "workload": {"name": "default"},
        "workflow": [
            {"step": "echo", "tool": {"kind": "python", "value": "{{ workload.name }}"}},
        ],
    }));
    let mut payload = serde_json::Map::new();
    payload.insert("name".into(), json!("override"));
    let id = stack.orch.submit(pb, payload).expect("submit");

    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);
    assert_eq!(state.step_results["echo"].render_view(), json!("override"));
}

#[tokio::test]
async fn status_reports_progress_and_current_step() {
    let stack = stack();
    let id = submit(
        &stack,
        playbook(json!({
            "workflow": [
                {"step": "only", "tool": {"kind": "python", "value": 1}},
            ],
        })),
    );

    run_to_terminal(&stack, id).await;
    let status = stack.orch.status(id).expect("status");
    assert_eq!(status.status, noetl_core::ExecutionStatus::Completed);
    assert_eq!(status.total_steps, 1);
    assert_eq!(status.completed_steps, 1);
    assert_eq!(status.failed_steps, 0);
    assert!(!status.is_cancelled);
}
