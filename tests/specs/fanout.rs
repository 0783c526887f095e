// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fan-out / fan-in: shards as child executions with a fan-in manifest.

use super::support::*;
use noetl_core::{Event, ExecutionStatus, ToolError};
use serde_json::json;
use std::sync::Arc;

/// Fails for the two poisoned items, succeeds otherwise.
fn shard_tool() -> Arc<dyn noetl_worker::ToolExecutor> {
    Arc::new(FnTool(|payload: &serde_json::Value| {
        let item = payload.get("value").and_then(serde_json::Value::as_i64).unwrap_or(0);
        if item == 13 || item == 77 {
            return Err(ToolError::http(500, format!("item {item} exploded")));
        }
        Ok(json!({"processed": item}))
    }))
}

fn fanout_playbook(count: i64, allow_partial: bool) -> noetl_playbook::Playbook {
    let items: Vec<i64> = (0..count).collect();
    playbook(json!({
        "workload": {"items": items},
        "workflow": [
            {
                "step": "process_items",
                "tool": {"kind": "shardwork", "value": "{{ iterator.item }}"},
                "loop": {"in": "{{ workload.items }}", "iterator": "item", "mode": "fanout"},
                "fanout": {"allow_partial": allow_partial},
                "next": [
                    {"when": "{{ fanin.status == 'partial' }}", "then": "reduce_partial"},
                    {"then": "reduce"},
                ],
            },
            {"step": "reduce", "tool": {"kind": "shardwork", "value": 0}},
            {"step": "reduce_partial", "tool": {"kind": "shardwork", "value": 0}},
        ],
    }))
}

#[tokio::test]
async fn hundred_shards_with_two_failures_fan_in_partial() {
    let stack =
        stack_with(|_| noetl_worker::ToolRegistry::new().register("shardwork", shard_tool()));
    let id = submit(&stack, fanout_playbook(100, true));
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    // Fan-in tracker: 98 succeeded, 2 failed.
    let tracker = &state.fanin["process_items"];
    assert_eq!(tracker.total_expected, 100);
    assert_eq!(tracker.succeeded, 98);
    assert_eq!(tracker.failed, 2);
    assert_eq!(tracker.status(), "partial");

    // 100 shard child executions, each linked to this parent.
    let records = stack.orch.log().events(id);
    let shard_children: Vec<noetl_core::ExecutionId> = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::ShardCompleted { child_execution_id, .. } => Some(*child_execution_id),
            _ => None,
        })
        .collect();
    assert_eq!(shard_children.len(), 100);
    for child in &shard_children {
        let child_state = stack.orch.log().project(*child);
        assert_eq!(child_state.parent_execution_id, Some(id));
        assert!(child_state.is_terminal());
    }

    // The parent step's call.done carries the shard manifest.
    let manifest = records
        .iter()
        .find_map(|r| match &r.event {
            Event::CallDone { step, result, .. } if step == "process_items" => {
                Some(result.render_view())
            }
            _ => None,
        })
        .expect("manifest call.done");
    assert_eq!(manifest["status"], json!("partial"));
    assert_eq!(manifest["succeeded"], json!(98));
    assert_eq!(manifest["failed"], json!(2));
    assert_eq!(manifest["shards"].as_array().expect("shards").len(), 100);

    // Routing saw fanin.status == "partial".
    assert!(state.step_results.contains_key("reduce_partial"));
    assert!(!state.step_results.contains_key("reduce"));
}

#[tokio::test]
async fn fail_fast_aborts_remaining_shards() {
    let stack =
        stack_with(|_| noetl_worker::ToolRegistry::new().register("shardwork", shard_tool()));
    // Items 0..20 include the poisoned 13; fail_fast is the default.
    let id = submit(&stack, fanout_playbook(20, false));
    let state = run_to_terminal(&stack, id).await;

    assert_eq!(state.status, ExecutionStatus::Failed);
    let types = event_types(&stack, id);
    assert!(types.contains(&"iterator_failed".to_string()));

    // Shards that never ran were cancelled rather than executed.
    let children = stack
        .orch
        .log()
        .execution_ids()
        .into_iter()
        .filter(|child| *child != id)
        .collect::<Vec<_>>();
    // Give the cancelled children time to drain to terminal states.
    for _ in 0..100 {
        if children.iter().all(|c| stack.orch.log().project(*c).is_terminal()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let cancelled = children
        .iter()
        .filter(|child| {
            stack.orch.log().project(**child).status == ExecutionStatus::Cancelled
        })
        .count();
    let succeeded = children
        .iter()
        .filter(|child| {
            stack.orch.log().project(**child).status == ExecutionStatus::Completed
        })
        .count();
    assert_eq!(children.len(), 20);
    assert!(cancelled + succeeded == 19, "one shard failed, the rest settled");
}

#[tokio::test]
async fn clean_fanout_fan_in_reports_complete() {
    let stack =
        stack_with(|_| noetl_worker::ToolRegistry::new().register("shardwork", shard_tool()));
    let id = submit(&stack, fanout_playbook(5, true));
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    assert_eq!(state.fanin["process_items"].status(), "complete");
    assert!(state.step_results.contains_key("reduce"));
}
