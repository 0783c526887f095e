// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use noetl_core::{FakeClock, StepResult, WorkerId};
use noetl_storage::MemoryKv;
use serde_json::json;
use std::time::Duration;

fn harness() -> (Arc<Orchestrator<FakeClock>>, FakeClock) {
    let clock = FakeClock::new();
    let metrics = Metrics::new();
    let log = Arc::new(DurableLog::in_memory());
    let queue = Arc::new(CommandQueue::new(clock.clone(), metrics.clone()));
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let store = Arc::new(TieredStore::in_memory());
    let orch = Orchestrator::new(
        log,
        queue,
        kv,
        store,
        clock.clone(),
        EngineConfig::default(),
        metrics,
    );
    (orch, clock)
}

fn linear_playbook() -> Playbook {
    serde_json::from_value(json!({
        "metadata": {"path": "pb/linear", "name": "linear"},
        "workflow": [
            {"step": "start", "next": [{"then": "a"}]},
            {
                "step": "a",
                "tool": {"kind": "mock", "value": {"x": 1}},
                "vars": {"x": "{{ a.x }}"},
                "next": [{"then": "b"}],
            },
            {"step": "b", "tool": {"kind": "mock", "value": "{{ a.x }}"}},
        ],
    }))
    .unwrap()
}

/// Minimal in-test worker: lease one command, emit `call.started` plus a
/// terminal event, ack. The mock tool echoes its `value` param.
fn run_mock_worker(orch: &Arc<Orchestrator<FakeClock>>, clock: &FakeClock) -> bool {
    let worker = WorkerId::from_string("wkr-test");
    let Some(cmd) = orch.queue().lease("default", &worker, 30) else {
        return false;
    };
    let log = orch.log();
    let now = clock.epoch_ms();
    // Iterations carry their own iteration events; attempts get call.started.
    if cmd.meta.iteration.is_none() {
        let _ = log.append(EventRecord::new(
            cmd.execution_id,
            Event::CallStarted {
                step: cmd.step.clone(),
                attempt: cmd.attempt,
                node_type: cmd.node_type.clone(),
            },
            now,
        ));
    }
    let value = cmd.payload.get("value").cloned().unwrap_or(Value::Null);
    let event = if let Some(iteration) = &cmd.meta.iteration {
        Event::IterationCompleted {
            step: cmd.step.clone(),
            index: iteration.index,
            result: value,
        }
    } else {
        Event::CallDone {
            step: cmd.step.clone(),
            attempt: cmd.attempt,
            result: StepResult::inline(value),
            meta: serde_json::Map::new(),
        }
    };
    let _ = log.append(EventRecord::new(cmd.execution_id, event, now));
    orch.queue().ack(cmd.queue_id);
    true
}

/// Pump workers until the execution reaches a terminal state.
async fn drain(orch: &Arc<Orchestrator<FakeClock>>, clock: &FakeClock, id: ExecutionId) {
    for _ in 0..200 {
        run_mock_worker(orch, clock);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if orch.log().project(id).is_terminal() {
            // Let the driver finish housekeeping.
            tokio::time::sleep(Duration::from_millis(20)).await;
            return;
        }
    }
    panic!("execution {id} did not reach a terminal state");
}

#[tokio::test]
async fn linear_playbook_runs_to_completion() {
    let (orch, clock) = harness();
    let id = orch.submit(linear_playbook(), serde_json::Map::new()).unwrap();
    drain(&orch, &clock, id).await;

    let state = orch.log().project(id);
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.variables.get("x"), Some(&json!(1)));
    assert!(state.step_results.contains_key("a"));
    assert!(state.step_results.contains_key("b"));

    let status = orch.status(id).unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
    assert_eq!(status.failed_steps, 0);
}

#[tokio::test]
async fn status_for_unknown_execution_errors() {
    let (orch, _) = harness();
    assert!(matches!(
        orch.status(ExecutionId(404)),
        Err(EngineError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn set_variable_projects_without_reexecution() {
    let (orch, clock) = harness();
    let id = orch.submit(linear_playbook(), serde_json::Map::new()).unwrap();
    drain(&orch, &clock, id).await;

    let before = orch.log().events(id).len();
    orch.set_variable(id, "injected", json!(42)).unwrap();
    let state = orch.log().project(id);
    assert_eq!(state.variables.get("injected"), Some(&json!(42)));
    assert_eq!(orch.log().events(id).len(), before + 1);
}

#[tokio::test]
async fn cancel_drops_queued_commands_and_terminates() {
    let (orch, _clock) = harness();
    let id = orch.submit(linear_playbook(), serde_json::Map::new()).unwrap();

    // Let the driver enqueue step a's command, then cancel before any
    // worker leases it.
    tokio::time::sleep(Duration::from_millis(30)).await;
    orch.cancel(id, false, Some("operator".into())).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let records = orch.log().events(id);
    assert!(records
        .iter()
        .any(|r| matches!(r.event, Event::CommandCancelled { .. })));
    let state = orch.log().project(id);
    assert_eq!(state.status, ExecutionStatus::Cancelled);
    assert!(orch.is_cancellation_requested(id));

    // No further commands are leaseable.
    let worker = WorkerId::from_string("wkr-x");
    assert!(orch.queue().lease("default", &worker, 10).is_none());
}

#[tokio::test]
async fn retry_command_becomes_available_after_delay() {
    let (orch, clock) = harness();
    let pb: Playbook = serde_json::from_value(json!({
        "workflow": [{
            "step": "flaky",
            "tool": {"kind": "mock", "value": 1},
            "retry": {"max_attempts": 2, "initial_delay_ms": 1000},
        }],
    }))
    .unwrap();
    let id = orch.submit(pb, serde_json::Map::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Fail attempt 1 by hand.
    let worker = WorkerId::from_string("wkr-test");
    let cmd = orch.queue().lease("default", &worker, 30).unwrap();
    let _ = orch.log().append(EventRecord::new(
        id,
        Event::CallFailed {
            step: cmd.step.clone(),
            attempt: 1,
            error: noetl_core::ToolError::http(503, "unavailable"),
        },
        clock.epoch_ms(),
    ));
    orch.queue().ack(cmd.queue_id);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Scheduled retry is not yet visible...
    assert!(orch.queue().lease("default", &worker, 30).is_none());
    let records = orch.log().events(id);
    assert!(records
        .iter()
        .any(|r| matches!(r.event, Event::RetryScheduled { next_attempt: 2, .. })));

    // ...until the backoff elapses (jitter is off, so exactly 1s).
    clock.advance(Duration::from_millis(1_100));
    let retry = orch.queue().lease("default", &worker, 30).unwrap();
    assert_eq!(retry.attempt, 2);
}

#[tokio::test]
async fn resume_reattaches_driver_and_completes() {
    let (orch, clock) = harness();

    // Simulate a log left behind by a crashed engine: the start event is
    // durable but no driver is attached.
    let id = ExecutionId(501);
    let mut workload = serde_json::Map::new();
    workload.insert("n".into(), json!(5));
    orch.log()
        .append(EventRecord::new(
            id,
            Event::ExecutionStarted {
                catalog_id: "pb/resume".into(),
                parent_execution_id: None,
                workload,
            },
            clock.epoch_ms(),
        ))
        .unwrap();

    let pb: Playbook = serde_json::from_value(json!({
        "workflow": [
            {"step": "only", "tool": {"kind": "mock", "value": "{{ workload.n }}"}},
        ],
    }))
    .unwrap();
    orch.resume(id, pb).unwrap();
    drain(&orch, &clock, id).await;

    let state = orch.log().project(id);
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.step_results["only"].render_view(), json!(5));
}

#[tokio::test]
async fn resume_of_terminal_execution_is_a_no_op() {
    let (orch, clock) = harness();
    let id = orch.submit(linear_playbook(), serde_json::Map::new()).unwrap();
    drain(&orch, &clock, id).await;

    let before = orch.log().events(id).len();
    orch.resume(id, linear_playbook()).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(orch.log().events(id).len(), before);
}

#[tokio::test]
async fn sequential_loop_preserves_order() {
    let (orch, clock) = harness();
    let pb: Playbook = serde_json::from_value(json!({
        "workload": {"cities": [{"name": "A", "lat": 1}, {"name": "B", "lat": 2}]},
        "workflow": [{
            "step": "fetch_weather",
            "tool": {"kind": "mock", "value": {"temp": "{{ iterator.city.lat * 10 }}"}},
            "loop": {"in": "{{ workload.cities }}", "iterator": "city"},
        }],
    }))
    .unwrap();
    let id = orch.submit(pb, serde_json::Map::new()).unwrap();
    drain(&orch, &clock, id).await;

    let state = orch.log().project(id);
    assert_eq!(state.status, ExecutionStatus::Completed);
    let loop_state = &state.loop_state["fetch_weather"];
    assert_eq!(loop_state.ordered_results(), vec![json!({"temp": 10}), json!({"temp": 20})]);
    assert_eq!(
        state.step_results["fetch_weather"].render_view(),
        json!([{"temp": 10}, {"temp": 20}])
    );
}
