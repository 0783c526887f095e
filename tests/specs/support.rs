// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness: a full in-process stack (log, queue, KV, store,
//! orchestrator, one worker) with scripted mock tools.

use async_trait::async_trait;
use noetl_core::{ExecutionId, ExecutionStatus, FakeClock, Metrics, ToolError};
use noetl_engine::{EngineConfig, Orchestrator};
use noetl_playbook::Playbook;
use noetl_queue::CommandQueue;
use noetl_storage::{DurableLog, ExecutionState, KvStore, MemoryKv, TieredStore};
use noetl_worker::{ExecutionContext, ToolExecutor, ToolRegistry, Worker, WorkerConfig};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct Stack {
    pub clock: FakeClock,
    pub orch: Arc<Orchestrator<FakeClock>>,
    pub worker: Arc<Worker<FakeClock>>,
}

/// Wrap a closure as a tool executor.
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F> ToolExecutor for FnTool<F>
where
    F: Fn(&Value) -> Result<Value, ToolError> + Send + Sync,
{
    async fn execute(&self, payload: &Value, _ctx: &ExecutionContext) -> Result<Value, ToolError> {
        (self.0)(payload)
    }
}

/// Mock `python` tool: echoes its (already rendered) `value` param.
pub fn python_mock() -> Arc<dyn ToolExecutor> {
    Arc::new(FnTool(|payload: &Value| {
        Ok(payload.get("value").cloned().unwrap_or(Value::Null))
    }))
}

/// Build the stack. `tools` receives the orchestrator so executors (the
/// `playbook` tool) can reach the engine.
pub fn stack_with(
    tools: impl FnOnce(&Arc<Orchestrator<FakeClock>>) -> ToolRegistry,
) -> Stack {
    let clock = FakeClock::new();
    let metrics = Metrics::new();
    let log = Arc::new(DurableLog::in_memory());
    let queue = Arc::new(CommandQueue::new(clock.clone(), metrics.clone()));
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let store = Arc::new(TieredStore::in_memory());

    let orch = Orchestrator::new(
        Arc::clone(&log),
        Arc::clone(&queue),
        kv,
        Arc::clone(&store),
        clock.clone(),
        EngineConfig::default(),
        metrics,
    );

    let registry = Arc::new(tools(&orch));
    let worker =
        Arc::new(Worker::new(log, queue, store, registry, clock.clone(), WorkerConfig::default()));

    Stack { clock, orch, worker }
}

/// Spawn `count` background worker loops (needed when a tool blocks on
/// another execution, e.g. sub-playbooks). Returns the shutdown token.
pub fn spawn_workers(stack: &Stack, count: usize) -> tokio_util::sync::CancellationToken {
    let shutdown = tokio_util::sync::CancellationToken::new();
    for _ in 0..count {
        let worker = Arc::clone(&stack.worker);
        let token = shutdown.clone();
        tokio::spawn(async move { worker.run(token).await });
    }
    shutdown
}

/// Wait for a terminal state without pumping workers (they run in the
/// background via [`spawn_workers`]).
pub async fn wait_terminal(stack: &Stack, id: ExecutionId) -> ExecutionState {
    for _ in 0..2_000 {
        let state = stack.orch.log().project(id);
        if state.is_terminal() {
            tokio::time::sleep(Duration::from_millis(25)).await;
            return stack.orch.log().project(id);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution {id} did not reach a terminal state");
}

/// Stack with just the `python` echo mock.
pub fn stack() -> Stack {
    stack_with(|_| ToolRegistry::new().register("python", python_mock()))
}

pub fn playbook(v: Value) -> Playbook {
    serde_json::from_value(v).expect("valid playbook document")
}

pub fn submit(stack: &Stack, pb: Playbook) -> ExecutionId {
    stack.orch.submit(pb, Map::new()).expect("submit")
}

/// Pump the worker (advancing the fake clock so scheduled retries become
/// visible) until the execution reaches a terminal state.
pub async fn run_to_terminal(stack: &Stack, id: ExecutionId) -> ExecutionState {
    for _ in 0..2_000 {
        let worked = stack.worker.run_once().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        if !worked {
            // Nothing leasable: release any scheduled retries.
            stack.clock.advance(Duration::from_millis(250));
        }
        let state = stack.orch.log().project(id);
        if state.is_terminal() {
            // Let drivers finish housekeeping (fan-in reports, sweeps).
            tokio::time::sleep(Duration::from_millis(25)).await;
            return stack.orch.log().project(id);
        }
    }
    panic!("execution {id} did not reach a terminal state");
}

/// Event type names, in log order.
pub fn event_types(stack: &Stack, id: ExecutionId) -> Vec<String> {
    stack
        .orch
        .log()
        .events(id)
        .iter()
        .map(|r| r.event.type_name().to_string())
        .collect()
}

pub fn assert_completed(state: &ExecutionState) {
    assert_eq!(
        state.status,
        ExecutionStatus::Completed,
        "expected COMPLETED, failure: {:?}",
        state.failure
    );
}
