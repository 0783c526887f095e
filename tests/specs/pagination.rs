// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pagination with append merge across four pages.

use super::support::*;
use noetl_core::Event;
use serde_json::json;
use std::sync::Arc;

/// Serves 4 pages of 4 items each: page p → [4p-3 .. 4p].
fn paged_http() -> Arc<dyn noetl_worker::ToolExecutor> {
    Arc::new(FnTool(|payload: &serde_json::Value| {
        let page = payload
            .pointer("/params/page")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(1);
        let base = (page - 1) * 4;
        Ok(json!({
            "data": {
                "data": [base + 1, base + 2, base + 3, base + 4],
                "paging": {"hasMore": page < 4, "page": page},
            }
        }))
    }))
}

fn paging_playbook(max_iterations: u32) -> noetl_playbook::Playbook {
    playbook(json!({
        "workflow": [{
            "step": "fetch_pages",
            "tool": {"kind": "http", "url": "https://api/items", "params": {"page": 1}},
            "pagination": {
                "continue_while": "{{ response.data.paging.hasMore }}",
                "next_page": {"params.page": "{{ response.data.paging.page + 1 }}"},
                "merge_strategy": "append",
                "merge_path": "data.data",
                "max_iterations": max_iterations,
            },
        }],
    }))
}

#[tokio::test]
async fn four_pages_append_into_one_result() {
    let stack = stack_with(|_| noetl_worker::ToolRegistry::new().register("http", paged_http()));
    let id = submit(&stack, paging_playbook(100));
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    let records = stack.orch.log().events(id);
    let pages: Vec<(u32, serde_json::Value)> = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::CallDone { attempt, result, .. } => Some((*attempt, result.render_view())),
            _ => None,
        })
        .collect();

    // One call.done per page, each carrying the running accumulator.
    assert_eq!(pages.len(), 4);
    assert_eq!(pages[0].1, json!([1, 2, 3, 4]));
    assert_eq!(pages[1].1, json!([1, 2, 3, 4, 5, 6, 7, 8]));
    assert_eq!(
        pages[3].1,
        json!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16])
    );

    // Final step result equals the merged accumulator.
    assert_eq!(
        state.step_results["fetch_pages"].render_view(),
        json!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16])
    );

    // Each page's call.done records the raw page for condition evaluation.
    let first_done = records
        .iter()
        .find_map(|r| match &r.event {
            Event::CallDone { meta, .. } => Some(meta.clone()),
            _ => None,
        })
        .expect("call.done meta");
    assert_eq!(first_done["response"]["data"]["paging"]["page"], json!(1));
}

#[tokio::test]
async fn max_iterations_stops_with_marker() {
    let stack = stack_with(|_| noetl_worker::ToolRegistry::new().register("http", paged_http()));
    // Budget of 2 pages although the source has 4.
    let id = submit(&stack, paging_playbook(2));
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    let records = stack.orch.log().events(id);
    let dones: Vec<&serde_json::Map<String, serde_json::Value>> = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::CallDone { meta, .. } => Some(meta),
            _ => None,
        })
        .collect();
    assert_eq!(dones.len(), 2);
    assert_eq!(dones[1].get("stopped_by"), Some(&json!("max_iterations")));

    assert_eq!(
        state.step_results["fetch_pages"].render_view(),
        json!([1, 2, 3, 4, 5, 6, 7, 8])
    );
}
