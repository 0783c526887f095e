// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancellation mid-loop and cascade to children.

use super::support::*;
use noetl_core::{Event, ExecutionStatus};
use serde_json::json;
use std::time::Duration;

fn ten_iteration_playbook() -> noetl_playbook::Playbook {
    playbook(json!({
        "workload": {"items": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]},
        "workflow": [{
            "step": "work",
            "tool": {"kind": "python", "value": "{{ iterator.item }}"},
            "loop": {"in": "{{ workload.items }}", "iterator": "item"},
        }],
    }))
}

#[tokio::test]
async fn cancel_mid_loop_stops_new_iterations() {
    let stack = stack();
    let id = submit(&stack, ten_iteration_playbook());

    // Run until iterations 0..3 have completed.
    for _ in 0..500 {
        stack.worker.run_once().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let state = stack.orch.log().project(id);
        if state.loop_state.get("work").map(|l| l.completed_count >= 4).unwrap_or(false) {
            break;
        }
    }

    // Let the driver finish reacting to the last completion before the
    // cancellation lands, so the event order in the log is stable.
    tokio::time::sleep(Duration::from_millis(30)).await;
    stack.orch.cancel(id, false, Some("operator request".into())).expect("cancel");

    // Drain whatever is already leased or queued.
    for _ in 0..100 {
        stack.worker.run_once().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        if stack.orch.log().project(id).is_terminal() {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(25)).await;

    let state = stack.orch.log().project(id);
    assert_eq!(state.status, ExecutionStatus::Cancelled);
    assert!(state.cancellation_requested);

    let records = stack.orch.log().events(id);
    assert!(records
        .iter()
        .any(|r| matches!(r.event, Event::ExecutionCancelled { .. })));

    // The iteration in flight at cancellation time either completed
    // normally or was drained as command.cancelled; nothing beyond it
    // was ever dispatched.
    let max_started = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::IterationStarted { index, .. } => Some(*index),
            _ => None,
        })
        .max()
        .expect("some iterations ran");
    assert!(max_started <= 4, "iteration {max_started} dispatched after cancel");

    // No new iterations after the cancellation event.
    let cancel_at = records
        .iter()
        .position(|r| matches!(r.event, Event::ExecutionCancelled { .. }))
        .expect("cancellation recorded");
    assert!(!records[cancel_at..]
        .iter()
        .any(|r| matches!(r.event, Event::IterationStarted { .. })));
}

#[tokio::test]
async fn queued_command_is_cancelled_not_executed() {
    let stack = stack();
    let id = submit(
        &stack,
        playbook(json!({
            "workflow": [{"step": "only", "tool": {"kind": "python", "value": 1}}],
        })),
    );

    // Give the driver time to enqueue, then cancel before any worker runs.
    tokio::time::sleep(Duration::from_millis(30)).await;
    stack.orch.cancel(id, false, None).expect("cancel");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let types = event_types(&stack, id);
    assert!(types.contains(&"command.cancelled".to_string()));
    assert!(!types.contains(&"call.started".to_string()));
    assert_eq!(stack.orch.log().project(id).status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn cascade_cancels_child_executions() {
    let stack = stack();
    // Fan-out parent whose children take work from the same pool.
    let id = submit(
        &stack,
        playbook(json!({
            "workload": {"items": [1, 2, 3, 4]},
            "workflow": [{
                "step": "spread",
                "tool": {"kind": "python", "value": "{{ iterator.item }}"},
                "loop": {"in": "{{ workload.items }}", "iterator": "item", "mode": "fanout"},
                "fanout": {"allow_partial": true},
            }],
        })),
    );

    // Let shards spawn, then cascade-cancel the parent without running
    // any worker.
    tokio::time::sleep(Duration::from_millis(60)).await;
    stack.orch.cancel(id, true, Some("cascade".into())).expect("cancel");
    tokio::time::sleep(Duration::from_millis(60)).await;

    let parent = stack.orch.log().project(id);
    assert_eq!(parent.status, ExecutionStatus::Cancelled);

    // Every child saw its own cancellation.
    let children: Vec<_> = stack
        .orch
        .log()
        .execution_ids()
        .into_iter()
        .filter(|child| *child != id)
        .collect();
    assert!(!children.is_empty(), "shards were submitted");
    for child in children {
        let state = stack.orch.log().project(child);
        assert_eq!(state.parent_execution_id, Some(id));
        assert!(state.cancellation_requested, "child {child} not cancelled");
    }
}
