// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry on HTTP 503: two failures, then success.

use super::support::*;
use noetl_core::{Event, ToolError};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

/// Fails with 503 `failures` times, then returns `{"ok": true}`.
fn flaky_http(failures: u32) -> Arc<dyn noetl_worker::ToolExecutor> {
    let remaining = Mutex::new(failures);
    Arc::new(FnTool(move |_payload: &serde_json::Value| {
        let mut remaining = remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(ToolError::http(503, "service unavailable"));
        }
        Ok(json!({"ok": true, "status_code": 200}))
    }))
}

fn retry_playbook() -> noetl_playbook::Playbook {
    playbook(json!({
        "workflow": [{
            "step": "a",
            "tool": {"kind": "http", "url": "https://upstream/thing"},
            "retry": {
                "max_attempts": 3,
                "initial_delay_ms": 1000,
                "backoff_multiplier": 2.0,
                "retry_when": "{{ status_code == 503 }}",
            },
        }],
    }))
}

#[tokio::test]
async fn two_503s_then_success_completes_on_third_attempt() {
    let stack = stack_with(|_| {
        noetl_worker::ToolRegistry::new().register("http", flaky_http(2))
    });
    let id = submit(&stack, retry_playbook());
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    let records = stack.orch.log().events(id);

    let started_attempts: Vec<u32> = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::CallStarted { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(started_attempts, vec![1, 2, 3]);

    let failed: Vec<(u32, Option<u16>)> = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::CallFailed { attempt, error, .. } => Some((*attempt, error.http_status)),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![(1, Some(503)), (2, Some(503))]);

    let done: Vec<u32> = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::CallDone { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(done, vec![3]);

    // Backoff: ~1s before attempt 2, ~2s before attempt 3 (jitter off).
    let delays: Vec<u64> = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1_000, 2_000]);

    assert_eq!(state.attempts["a"], 3);
    assert!(stack.orch.metrics().snapshot().step_retries_total >= 2);
}

#[tokio::test]
async fn budget_exhaustion_fails_with_last_error() {
    let stack = stack_with(|_| {
        noetl_worker::ToolRegistry::new().register("http", flaky_http(99))
    });
    let id = submit(&stack, retry_playbook());
    let state = run_to_terminal(&stack, id).await;

    assert_eq!(state.status, noetl_core::ExecutionStatus::Failed);
    let failure = state.failure.expect("failure details");
    assert_eq!(failure.step, "a");
    assert_eq!(failure.attempt, 3);
    assert_eq!(failure.error.http_status, Some(503));

    let status = stack.orch.status(id).expect("status");
    assert_eq!(status.error.expect("error").http_status, Some(503));
}

#[tokio::test]
async fn non_matching_error_fails_without_retry() {
    let stack = stack_with(|_| {
        noetl_worker::ToolRegistry::new().register(
            "http",
            Arc::new(FnTool(|_: &serde_json::Value| {
                Err(ToolError::http(404, "not found"))
            })) as Arc<dyn noetl_worker::ToolExecutor>,
        )
    });
    let id = submit(&stack, retry_playbook());
    let state = run_to_terminal(&stack, id).await;

    assert_eq!(state.status, noetl_core::ExecutionStatus::Failed);
    assert_eq!(state.attempts["a"], 1);
    assert!(!event_types(&stack, id).contains(&"retry_scheduled".to_string()));
}
