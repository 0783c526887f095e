// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sub-playbooks: the `playbook` tool submits a child execution and
//! awaits its terminal event.

use super::support::*;
use noetl_worker::{PlaybookHost, PlaybookTool, ToolRegistry};
use serde_json::json;
use std::sync::Arc;

fn nested_stack() -> Stack {
    stack_with(|orch| {
        let host: Arc<dyn PlaybookHost> = Arc::clone(orch) as Arc<dyn PlaybookHost>;
        ToolRegistry::new()
            .register("python", python_mock())
            .register("playbook", Arc::new(PlaybookTool::new(host)))
    })
}

#[tokio::test]
async fn parent_waits_for_child_and_reads_its_results() {
    let stack = nested_stack();
    // Two loops: one blocks inside the playbook tool while the other
    // serves the child's commands.
    let shutdown = spawn_workers(&stack, 2);
    let id = submit(
        &stack,
        playbook(json!({
            "metadata": {"path": "specs/parent", "name": "parent"},
            "workflow": [
                {
                    "step": "delegate",
                    "tool": {
                        "kind": "playbook",
                        "playbook": {
                            "metadata": {"path": "specs/child", "name": "child"},
                            "workflow": [
                                {"step": "inner", "tool": {"kind": "python", "value": {"answer": 42}}},
                            ],
                        },
                        "payload": {"from": "parent"},
                    },
                    "vars": {"answer": "{{ delegate.results.inner.answer }}"},
                },
            ],
        })),
    );

    let state = wait_terminal(&stack, id).await;
    shutdown.cancel();
    assert_completed(&state);
    assert_eq!(state.variables["answer"], json!(42));

    // Exactly one child execution, linked back to the parent.
    let children: Vec<_> = stack
        .orch
        .log()
        .execution_ids()
        .into_iter()
        .filter(|child| *child != id)
        .collect();
    assert_eq!(children.len(), 1);
    let child = stack.orch.log().project(children[0]);
    assert_eq!(child.parent_execution_id, Some(id));
    assert_eq!(child.status, noetl_core::ExecutionStatus::Completed);
    assert_eq!(child.workload.get("from"), Some(&json!("parent")));
}

#[tokio::test]
async fn child_failure_fails_the_parent_step() {
    let stack = nested_stack();
    let shutdown = spawn_workers(&stack, 2);
    let id = submit(
        &stack,
        playbook(json!({
            "workflow": [{
                "step": "delegate",
                "tool": {
                    "kind": "playbook",
                    "playbook": {
                        "workflow": [
                            // Unknown tool kind: the child fails with a schema error.
                            {"step": "broken", "tool": {"kind": "no_such_tool"}},
                        ],
                    },
                },
            }],
        })),
    );

    let state = wait_terminal(&stack, id).await;
    shutdown.cancel();
    assert_eq!(state.status, noetl_core::ExecutionStatus::Failed);
    let failure = state.failure.expect("failure");
    assert_eq!(failure.step, "delegate");
}
