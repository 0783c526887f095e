// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use noetl_core::test_support::{call_done, call_failed, record, started};
use noetl_core::{Event, ExecutionId, LoopMode, ShardOutcome, ToolError};
use proptest::prelude::*;
use serde_json::json;

const EXEC: ExecutionId = ExecutionId(7);

fn seq(events: Vec<EventRecord>) -> Vec<EventRecord> {
    events
        .into_iter()
        .enumerate()
        .map(|(i, mut r)| {
            r.event_id = noetl_core::EventId(i as u64 + 1);
            r
        })
        .collect()
}

#[test]
fn started_sets_workload_and_running() {
    let mut start = started(EXEC, "pb/weather");
    if let Event::ExecutionStarted { workload, .. } = &mut start.event {
        workload.insert("city".into(), json!("A"));
    }
    let state = ExecutionState::project(seq(vec![start]).iter());

    assert_eq!(state.status, noetl_core::ExecutionStatus::Running);
    assert_eq!(state.catalog_id, "pb/weather");
    assert_eq!(state.workload.get("city"), Some(&json!("A")));
}

#[test]
fn call_done_records_result_and_variable_set_projects() {
    let events = seq(vec![
        started(EXEC, "pb"),
        call_done(EXEC, "fetch", 1, json!({"x": 1})),
        record(EXEC, Event::VariableSet { name: "x".into(), value: json!(1) }),
    ]);
    let state = ExecutionState::project(events.iter());

    assert_eq!(state.step_results["fetch"].render_view(), json!({"x": 1}));
    assert_eq!(state.variables.get("x"), Some(&json!(1)));
}

#[test]
fn duplicate_terminal_is_ignored_first_wins() {
    let events = seq(vec![
        started(EXEC, "pb"),
        call_done(EXEC, "fetch", 1, json!({"v": "first"})),
        call_done(EXEC, "fetch", 1, json!({"v": "second"})),
    ]);
    let state = ExecutionState::project(events.iter());

    assert_eq!(state.step_results["fetch"].render_view(), json!({"v": "first"}));
    assert!(state.is_attempt_settled("fetch", 1));
}

#[test]
fn failed_then_retried_step_is_not_failed() {
    let events = seq(vec![
        started(EXEC, "pb"),
        record(EXEC, Event::CallStarted { step: "a".into(), attempt: 1, node_type: "http".into() }),
        call_failed(EXEC, "a", 1, ToolError::http(503, "u")),
        record(EXEC, Event::RetryScheduled {
            step: "a".into(),
            next_attempt: 2,
            delay_ms: 1_000,
            reason: "server_error".into(),
        }),
        record(EXEC, Event::CallStarted { step: "a".into(), attempt: 2, node_type: "http".into() }),
        call_done(EXEC, "a", 2, json!(1)),
    ]);
    let state = ExecutionState::project(events.iter());

    assert!(state.steps_failed.is_empty());
    assert!(state.retry_pending.is_empty());
    assert_eq!(state.attempts["a"], 2);
}

#[test]
fn loop_results_project_by_index() {
    let events = seq(vec![
        started(EXEC, "pb"),
        record(EXEC, Event::IteratorStarted {
            step: "cities".into(),
            collection_size: 3,
            mode: LoopMode::Async,
            iterator: "city".into(),
            loop_id: None,
        }),
        record(EXEC, Event::IterationCompleted { step: "cities".into(), index: 2, result: json!("c") }),
        record(EXEC, Event::IterationCompleted { step: "cities".into(), index: 0, result: json!("a") }),
        record(EXEC, Event::IterationCompleted { step: "cities".into(), index: 1, result: json!("b") }),
    ]);
    let state = ExecutionState::project(events.iter());

    let loop_state = &state.loop_state["cities"];
    assert!(loop_state.is_complete());
    assert_eq!(loop_state.ordered_results(), vec![json!("a"), json!("b"), json!("c")]);
}

#[test]
fn fanout_tracker_counts_shards() {
    let loop_id = noetl_core::LoopId::from_string("loop-x");
    let mut iterator_started = record(EXEC, Event::IteratorStarted {
        step: "items".into(),
        collection_size: 2,
        mode: LoopMode::Fanout,
        iterator: "item".into(),
        loop_id: Some(loop_id),
    });
    iterator_started.meta.insert("allow_partial".into(), json!(true));

    let events = seq(vec![
        started(EXEC, "pb"),
        iterator_started,
        record(EXEC, Event::ShardCompleted {
            step: "items".into(),
            index: 0,
            shard_id: noetl_core::ShardId::from_string("shd-0"),
            child_execution_id: ExecutionId(100),
            outcome: ShardOutcome::Succeeded,
            result_ref: Some("kv://r0".into()),
        }),
        record(EXEC, Event::ShardCompleted {
            step: "items".into(),
            index: 1,
            shard_id: noetl_core::ShardId::from_string("shd-1"),
            child_execution_id: ExecutionId(101),
            outcome: ShardOutcome::Failed,
            result_ref: None,
        }),
    ]);
    let state = ExecutionState::project(events.iter());

    let tracker = &state.fanin["items"];
    assert_eq!(tracker.succeeded, 1);
    assert_eq!(tracker.failed, 1);
    assert!(tracker.allow_partial);
    assert!(tracker.is_terminal());
    assert_eq!(tracker.status(), "partial");
    assert_eq!(state.loop_state["items"].shard_map.len(), 2);
}

#[test]
fn cancellation_sets_flag_and_terminal_status() {
    let events = seq(vec![
        started(EXEC, "pb"),
        record(EXEC, Event::ExecutionCancelled { reason: Some("user".into()), cascade: false }),
    ]);
    let state = ExecutionState::project(events.iter());

    assert!(state.cancellation_requested);
    assert_eq!(state.status, noetl_core::ExecutionStatus::Cancelled);
}

#[test]
fn late_terminal_after_cancellation_still_projects() {
    let events = seq(vec![
        started(EXEC, "pb"),
        record(EXEC, Event::ExecutionCancelled { reason: None, cascade: false }),
        call_done(EXEC, "inflight", 1, json!({"late": true})),
    ]);
    let state = ExecutionState::project(events.iter());

    assert_eq!(state.status, noetl_core::ExecutionStatus::Cancelled);
    assert!(state.step_results.contains_key("inflight"));
}

#[test]
fn failure_details_surface() {
    let events = seq(vec![
        started(EXEC, "pb"),
        call_failed(EXEC, "fetch", 3, ToolError::http(404, "gone")),
        record(EXEC, Event::ExecutionFailed {
            step: "fetch".into(),
            attempt: 3,
            error: ToolError::http(404, "gone"),
        }),
    ]);
    let state = ExecutionState::project(events.iter());

    assert_eq!(state.status, noetl_core::ExecutionStatus::Failed);
    let failure = state.failure.unwrap();
    assert_eq!(failure.step, "fetch");
    assert_eq!(failure.attempt, 3);
    assert_eq!(failure.error.http_status, Some(404));
}

#[test]
fn progress_counts_entered_exited_failed() {
    let events = seq(vec![
        started(EXEC, "pb"),
        record(EXEC, Event::StepEnter { step: "a".into(), node_type: "http".into() }),
        record(EXEC, Event::StepExit { step: "a".into(), next: Some("b".into()) }),
        record(EXEC, Event::StepEnter { step: "b".into(), node_type: "http".into() }),
        record(EXEC, Event::StepEnter { step: "c".into(), node_type: "http".into() }),
        call_failed(EXEC, "c", 1, ToolError::http(500, "x")),
    ]);
    let state = ExecutionState::project(events.iter());

    let (total, completed, running, failed) = state.progress();
    assert_eq!((total, completed, running, failed), (3, 1, 1, 1));
}

// Deterministic projection: applying any event sequence twice (or applying
// each event twice in place) always converges to the same state.
fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        Just(Event::ExecutionCompleted),
        Just(Event::ExecutionCancelled { reason: None, cascade: false }),
        ("[a-c]", 1u32..4).prop_map(|(step, attempt)| Event::CallStarted {
            step,
            attempt,
            node_type: "http".into(),
        }),
        ("[a-c]", 1u32..4, 0i64..100).prop_map(|(step, attempt, x)| Event::CallDone {
            step,
            attempt,
            result: noetl_core::StepResult::inline(json!({ "x": x })),
            meta: serde_json::Map::new(),
        }),
        ("[a-c]", 1u32..4).prop_map(|(step, attempt)| Event::CallFailed {
            step,
            attempt,
            error: ToolError::http(503, "u"),
        }),
        ("[a-c]", 0usize..4).prop_map(|(step, index)| Event::IterationCompleted {
            step,
            index,
            result: json!(index),
        }),
    ]
}

proptest! {
    #[test]
    fn projection_is_deterministic(events in proptest::collection::vec(arb_event(), 0..24)) {
        let records = seq(events.into_iter().map(|e| record(EXEC, e)).collect());
        let once = ExecutionState::project(records.iter());
        let twice = ExecutionState::project(records.iter());
        prop_assert_eq!(&once, &twice);
    }

    #[test]
    fn projection_is_idempotent_per_event(events in proptest::collection::vec(arb_event(), 0..24)) {
        let records = seq(events.into_iter().map(|e| record(EXEC, e)).collect());

        let folded = ExecutionState::project(records.iter());
        let mut doubled = ExecutionState::default();
        for r in &records {
            doubled.apply_event(r);
            doubled.apply_event(r);
        }
        prop_assert_eq!(&folded, &doubled);
    }
}
