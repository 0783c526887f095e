// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sequential and async loops.

use super::support::*;
use noetl_core::Event;
use serde_json::json;

fn weather_playbook(mode: &str) -> noetl_playbook::Playbook {
    playbook(json!({
        "workload": {"cities": [{"name": "A", "lat": 1}, {"name": "B", "lat": 2}]},
        "workflow": [
            {
                "step": "fetch_weather",
                "tool": {"kind": "python", "value": {"temp": "{{ iterator.city.lat * 10 }}"}},
                "loop": {"in": "{{ workload.cities }}", "iterator": "city", "mode": mode},
                "vars": {"temps": "{{ response }}"},
                "next": [{"then": "report"}],
            },
            {"step": "report", "tool": {"kind": "python", "value": "{{ fetch_weather }}"}},
        ],
    }))
}

#[tokio::test]
async fn sequential_loop_runs_in_index_order_and_routes_next() {
    let stack = stack();
    let id = submit(&stack, weather_playbook("sequential"));
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    let records = stack.orch.log().events(id);

    let iterator_started = records
        .iter()
        .find_map(|r| match &r.event {
            Event::IteratorStarted { collection_size, mode, .. } => {
                Some((*collection_size, *mode))
            }
            _ => None,
        })
        .expect("iterator_started");
    assert_eq!(iterator_started, (2, noetl_core::LoopMode::Sequential));

    // iteration_started/completed pairs in index order.
    let iteration_events: Vec<(String, usize)> = records
        .iter()
        .filter_map(|r| match &r.event {
            Event::IterationStarted { index, .. } => Some(("started".to_string(), *index)),
            Event::IterationCompleted { index, .. } => Some(("completed".to_string(), *index)),
            _ => None,
        })
        .collect();
    assert_eq!(
        iteration_events,
        vec![
            ("started".to_string(), 0),
            ("completed".to_string(), 0),
            ("started".to_string(), 1),
            ("completed".to_string(), 1),
        ]
    );

    let loop_state = &state.loop_state["fetch_weather"];
    assert_eq!(loop_state.ordered_results(), vec![json!({"temp": 10}), json!({"temp": 20})]);

    // The loop result flows to the next step and into vars.
    assert_eq!(
        state.step_results["report"].render_view(),
        json!([{"temp": 10}, {"temp": 20}])
    );
    assert_eq!(state.variables["temps"], json!([{"temp": 10}, {"temp": 20}]));
}

#[tokio::test]
async fn async_loop_results_are_ordered_by_index_not_completion() {
    let stack = stack();
    let pb = playbook(json!({
        "workload": {"items": [3, 1, 2, 5, 4, 0, 7, 6]},
        "workflow": [{
            "step": "double",
            "tool": {"kind": "python", "value": "{{ iterator.n * 2 }}"},
            "loop": {"in": "{{ workload.items }}", "iterator": "n", "mode": "async"},
        }],
    }));
    let id = submit(&stack, pb);
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    // Slot i corresponds to input element i regardless of completion order.
    assert_eq!(
        state.loop_state["double"].ordered_results(),
        vec![json!(6), json!(2), json!(4), json!(10), json!(8), json!(0), json!(14), json!(12)]
    );
}

#[tokio::test]
async fn empty_collection_completes_and_routes() {
    let stack = stack();
    let pb = playbook(json!({
        "workload": {"items": []},
        "workflow": [
            {
                "step": "noop_loop",
                "tool": {"kind": "python", "value": 1},
                "loop": {"in": "{{ workload.items }}", "iterator": "item"},
                "next": [{"then": "after"}],
            },
            {"step": "after", "tool": {"kind": "python", "value": "ran"}},
        ],
    }));
    let id = submit(&stack, pb);
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    let types = event_types(&stack, id);
    let started_at = types.iter().position(|t| t == "iterator_started").expect("started");
    let completed_at = types.iter().position(|t| t == "iterator_completed").expect("completed");
    assert!(started_at < completed_at);

    assert_eq!(state.step_results["after"].render_view(), json!("ran"));
    assert!(state.loop_state["noop_loop"].ordered_results().is_empty());
}

#[tokio::test]
async fn chunked_loop_processes_batches() {
    let stack = stack();
    let pb = playbook(json!({
        "workload": {"items": [1, 2, 3, 4, 5]},
        "workflow": [{
            "step": "batches",
            "tool": {"kind": "python", "value": "{{ iterator.chunk | length }}"},
            "loop": {"in": "{{ workload.items }}", "iterator": "chunk", "mode": "chunked", "chunk_size": 2},
        }],
    }));
    let id = submit(&stack, pb);
    let state = run_to_terminal(&stack, id).await;
    assert_completed(&state);

    // 5 elements in chunks of 2 → 3 iterations of sizes 2, 2, 1.
    assert_eq!(
        state.loop_state["batches"].ordered_results(),
        vec![json!(2), json!(2), json!(1)]
    );
}
