// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orchestrator: the single-writer loop that drives each execution.
//!
//! One tokio task per execution consumes that execution's event feed,
//! advances the projection, runs the decision function, and executes the
//! resulting actions. All coordination with workers goes through the
//! queue and the event log.

use crate::decide::{decide, DecisionCtx};
use crate::{Action, EngineConfig, EngineError};
use noetl_core::{
    Clock, Event, EventId, EventRecord, ExecutionId, ExecutionIdGen, ExecutionStatus, Metrics,
    ResultRef, ResultScope, ShardId, ShardOutcome, ToolError,
};
use noetl_playbook::{Playbook, Step, Templates};
use noetl_queue::CommandQueue;
use noetl_storage::{
    kv_append_by_index, loop_kv_key, DurableLog, ExecutionState, KvStore, LogError, TieredStore,
};
use parking_lot::Mutex;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Where a fan-out shard child reports back to.
#[derive(Debug, Clone)]
struct ShardLink {
    parent: ExecutionId,
    step: String,
    index: usize,
    shard_id: ShardId,
}

/// `status()` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusView {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub running_steps: usize,
    pub failed_steps: usize,
    pub is_cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<noetl_core::ToolError>,
}

/// The execution engine.
pub struct Orchestrator<C: Clock> {
    log: Arc<DurableLog>,
    queue: Arc<CommandQueue<C>>,
    kv: Arc<dyn KvStore>,
    store: Arc<TieredStore>,
    clock: C,
    config: EngineConfig,
    templates: Templates,
    metrics: Metrics,
    id_gen: ExecutionIdGen,
    playbooks: Mutex<HashMap<ExecutionId, Arc<Playbook>>>,
    children: Mutex<HashMap<ExecutionId, Vec<ExecutionId>>>,
    shard_links: Mutex<HashMap<ExecutionId, ShardLink>>,
    /// Back-reference for spawning child drivers from `&self` contexts
    weak: std::sync::Weak<Orchestrator<C>>,
}

impl<C: Clock> Orchestrator<C> {
    pub fn new(
        log: Arc<DurableLog>,
        queue: Arc<CommandQueue<C>>,
        kv: Arc<dyn KvStore>,
        store: Arc<TieredStore>,
        clock: C,
        config: EngineConfig,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            log,
            queue,
            kv,
            store,
            clock,
            config,
            templates: Templates::new(),
            metrics,
            id_gen: ExecutionIdGen::new(),
            playbooks: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            shard_links: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    pub fn log(&self) -> Arc<DurableLog> {
        Arc::clone(&self.log)
    }

    pub fn queue(&self) -> Arc<CommandQueue<C>> {
        Arc::clone(&self.queue)
    }

    pub fn store(&self) -> Arc<TieredStore> {
        Arc::clone(&self.store)
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    /// Accept a playbook + payload; returns as soon as
    /// `execution.started` is durable.
    pub fn submit(
        self: &Arc<Self>,
        playbook: Playbook,
        payload: Map<String, Value>,
    ) -> Result<ExecutionId, EngineError> {
        self.submit_inner(playbook, payload, None)
    }

    fn submit_inner(
        self: &Arc<Self>,
        playbook: Playbook,
        payload: Map<String, Value>,
        parent: Option<ExecutionId>,
    ) -> Result<ExecutionId, EngineError> {
        let execution_id = self.id_gen.next(self.clock.epoch_ms());

        // Submit payload overrides playbook workload defaults.
        let mut workload = playbook.workload.clone();
        for (k, v) in payload {
            workload.insert(k, v);
        }

        let catalog_id = if playbook.metadata.path.is_empty() {
            playbook.metadata.name.clone()
        } else {
            playbook.metadata.path.clone()
        };

        self.playbooks.lock().insert(execution_id, Arc::new(playbook));
        if let Some(parent) = parent {
            self.children.lock().entry(parent).or_default().push(execution_id);
        }

        let record = EventRecord::new(
            execution_id,
            Event::ExecutionStarted {
                catalog_id,
                parent_execution_id: parent,
                workload,
            },
            self.clock.epoch_ms(),
        );
        self.append_with_retry(record)?;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(execution_id, EventId::ZERO).await });

        tracing::info!(execution_id = %execution_id, parent = ?parent, "execution submitted");
        Ok(execution_id)
    }

    /// Re-attach a driver to an execution already present in the log
    /// (engine restart). Events up to the current head are replayed into
    /// the projection without re-deciding; the head record is re-decided
    /// to kick the execution forward. Re-emitted commands collapse on
    /// the queue's dedupe key and duplicate terminals are dropped at
    /// ingest, so the re-kick is safe.
    pub fn resume(
        self: &Arc<Self>,
        execution_id: ExecutionId,
        playbook: Playbook,
    ) -> Result<(), EngineError> {
        let records = self.log.events(execution_id);
        let Some(head) = records.last() else {
            return Err(EngineError::ExecutionNotFound(execution_id));
        };
        let state = ExecutionState::project(records.iter());
        if state.is_terminal() {
            tracing::debug!(execution_id = %execution_id, "resume skipped, already terminal");
            return Ok(());
        }

        self.playbooks.lock().insert(execution_id, Arc::new(playbook));
        let decide_after = EventId(head.event_id.0.saturating_sub(1));
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(execution_id, decide_after).await });

        tracing::info!(execution_id = %execution_id, head = %head.event_id, "execution resumed");
        Ok(())
    }

    /// Current status, derived entirely from the projection.
    pub fn status(&self, execution_id: ExecutionId) -> Result<ExecutionStatusView, EngineError> {
        let records = self.log.events(execution_id);
        if records.is_empty() {
            return Err(EngineError::ExecutionNotFound(execution_id));
        }
        let state = ExecutionState::project(records.iter());
        let (total, completed, running, failed) = state.progress();
        Ok(ExecutionStatusView {
            execution_id,
            status: state.status,
            current_step: state.current_step.clone(),
            total_steps: total,
            completed_steps: completed,
            running_steps: running,
            failed_steps: failed,
            is_cancelled: state.cancellation_requested,
            error: state.failure.map(|f| f.error),
        })
    }

    /// Request cancellation. No rollback: in-flight attempts may still
    /// report terminal events, which project as usual.
    pub fn cancel(
        &self,
        execution_id: ExecutionId,
        cascade: bool,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let record = EventRecord::new(
            execution_id,
            Event::ExecutionCancelled { reason, cascade },
            self.clock.epoch_ms(),
        );
        self.append_with_retry(record)?;
        Ok(())
    }

    pub fn query_events(&self, execution_id: ExecutionId, since: EventId) -> Vec<EventRecord> {
        self.log.events_since(execution_id, since)
    }

    /// Inject a variable without re-executing any step.
    pub fn set_variable(
        &self,
        execution_id: ExecutionId,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), EngineError> {
        let record = EventRecord::new(
            execution_id,
            Event::VariableSet { name: name.into(), value },
            self.clock.epoch_ms(),
        );
        self.append_with_retry(record)?;
        Ok(())
    }

    /// Whether cancellation has been requested (worker-side check).
    pub fn is_cancellation_requested(&self, execution_id: ExecutionId) -> bool {
        self.log
            .events(execution_id)
            .iter()
            .any(|r| matches!(r.event, Event::ExecutionCancelled { .. }))
    }

    /// Block until the execution reaches a terminal status; returns the
    /// final projection. Used for sub-playbook awaits.
    pub async fn wait_terminal(&self, execution_id: ExecutionId) -> ExecutionState {
        let mut rx = self.log.subscribe(execution_id);
        loop {
            let state = self.log.project(execution_id);
            if state.is_terminal() {
                return state;
            }
            match rx.recv().await {
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return self.log.project(execution_id);
                }
            }
        }
    }

    /// Single-writer event loop for one execution.
    ///
    /// Records with `event_id ≤ decide_after` are folded into the
    /// projection without re-deciding (resume replay); everything after
    /// runs through the decision function.
    async fn drive(self: Arc<Self>, execution_id: ExecutionId, decide_after: EventId) {
        let mut rx = self.log.subscribe(execution_id);
        let mut cursor = EventId::ZERO;
        let mut state = ExecutionState::default();

        loop {
            let records = self.log.events_since(execution_id, cursor);
            if records.is_empty() {
                match rx.recv().await {
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }

            for record in records {
                cursor = record.event_id;
                state.apply_event(&record);
                if record.event_id > decide_after {
                    self.handle(&mut state, &record).await;
                }

                if record.event.is_execution_terminal() {
                    self.finish(execution_id, &state).await;
                    return;
                }
            }
        }
    }

    /// Decide and execute for one record. Decision errors are protocol
    /// errors: bounded retries for transient causes, then the execution
    /// fails with a diagnostic.
    async fn handle(&self, state: &mut ExecutionState, record: &EventRecord) {
        let playbook = match self.playbooks.lock().get(&record.execution_id) {
            Some(p) => Arc::clone(p),
            None => return,
        };

        let actions = {
            let ctx = DecisionCtx {
                playbook: &playbook,
                templates: &self.templates,
                config: &self.config,
                now_ms: self.clock.epoch_ms(),
                jitter: rand::rng().random_range(0.5..=1.5),
            };
            match decide(state, record, &ctx) {
                Ok(actions) => actions,
                Err(e) => {
                    tracing::error!(
                        execution_id = %record.execution_id,
                        event_id = %record.event_id,
                        error = %e,
                        "decision failed"
                    );
                    let error = ToolError::schema(e.to_string());
                    let step = record.event.step().unwrap_or_default().to_string();
                    let attempt = record.event.attempt().unwrap_or(0);
                    vec![Action::append(Event::ExecutionFailed { step, attempt, error })]
                }
            }
        };

        for action in actions {
            if let Err(e) = self.execute(state, record, action).await {
                tracing::error!(
                    execution_id = %record.execution_id,
                    error = %e,
                    "action execution failed"
                );
                let failed = EventRecord::new(
                    record.execution_id,
                    Event::ExecutionFailed {
                        step: record.event.step().unwrap_or_default().to_string(),
                        attempt: record.event.attempt().unwrap_or(0),
                        error: ToolError::new(
                            noetl_core::ToolErrorKind::Internal,
                            e.to_string(),
                        ),
                    },
                    self.clock.epoch_ms(),
                )
                .caused_by(record.event_id);
                let _ = self.append_with_retry(failed);
                return;
            }
        }
    }

    async fn execute(
        &self,
        state: &ExecutionState,
        record: &EventRecord,
        action: Action,
    ) -> Result<(), EngineError> {
        let info: String =
            action.fields().iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(" ");
        tracing::debug!(execution_id = %record.execution_id, "action={} {}", action.name(), info);

        match action {
            Action::Append { event, meta } => {
                match &event {
                    Event::RetryScheduled { .. } => self.metrics.step_retried(),
                    Event::IterationStarted { .. } => self.metrics.iteration_run(),
                    _ => {}
                }
                let mut out =
                    EventRecord::new(record.execution_id, event, self.clock.epoch_ms())
                        .caused_by(record.event_id);
                out.meta = meta;
                self.append_with_retry(out)?;
                Ok(())
            }
            Action::Enqueue(cmd) => {
                self.queue.enqueue(cmd);
                Ok(())
            }
            Action::MirrorLoop { key, value } => {
                self.kv.put(&key, value, None).await?;
                Ok(())
            }
            Action::AppendLoopResult { key, index, value } => {
                kv_append_by_index(self.kv.as_ref(), &key, index, value).await?;
                Ok(())
            }
            Action::CancelCommands { cascade } => {
                self.cancel_commands(record.execution_id, cascade)
            }
            Action::SubmitShard { step, index, shard_id, element } => {
                self.submit_shard(state, record.execution_id, &step, index, shard_id, element)
            }
            Action::CancelShards { step } => {
                let shards: Vec<ExecutionId> = {
                    let links = self.shard_links.lock();
                    links
                        .iter()
                        .filter(|(_, link)| {
                            link.parent == record.execution_id && link.step == step
                        })
                        .map(|(child, _)| *child)
                        .collect()
                };
                for child in shards {
                    if !self.log.project(child).is_terminal() {
                        self.cancel(child, false, Some("fan-out fail-fast".into()))?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Drop queued commands, record `command.cancelled` for each, and
    /// propagate to children when cascading.
    fn cancel_commands(
        &self,
        execution_id: ExecutionId,
        cascade: bool,
    ) -> Result<(), EngineError> {
        let removed = self.queue.cancel_for(execution_id);
        for cmd in removed {
            let record = EventRecord::new(
                execution_id,
                Event::CommandCancelled {
                    step: cmd.step,
                    attempt: cmd.attempt,
                    queue_id: Some(cmd.queue_id),
                },
                self.clock.epoch_ms(),
            );
            self.append_with_retry(record)?;
        }

        if cascade {
            let children: Vec<ExecutionId> =
                self.children.lock().get(&execution_id).cloned().unwrap_or_default();
            for child in children {
                if !self.log.project(child).is_terminal() {
                    self.cancel(child, true, Some("cascade".into()))?;
                }
            }
        }
        Ok(())
    }

    /// Launch one fan-out shard as a child execution running the loop
    /// step's tool with the iterator scope pre-rendered away.
    fn submit_shard(
        &self,
        state: &ExecutionState,
        parent: ExecutionId,
        step_name: &str,
        index: usize,
        shard_id: ShardId,
        element: Value,
    ) -> Result<(), EngineError> {
        let playbook = self
            .playbooks
            .lock()
            .get(&parent)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(parent))?;
        let step = playbook
            .step(step_name)
            .ok_or_else(|| EngineError::StepNotFound(step_name.to_string()))?;
        let loop_def = step
            .loop_def
            .as_ref()
            .ok_or_else(|| EngineError::PlaybookInvalid(format!("step '{step_name}' lost its loop")))?;
        let tool = playbook
            .resolve_tool(step)
            .ok_or_else(|| EngineError::PlaybookInvalid(format!("fan-out step '{step_name}' has no tool")))?;

        // Pre-render the shard's params with the iterator scope; the child
        // runs a fully concrete single-step workflow.
        let ctx_value = crate::render::state_context(state)
            .iterator(&loop_def.iterator, element, index)
            .build();
        let params = self
            .templates
            .render_value(&Value::Object(tool.params.clone()), &ctx_value)
            .map_err(|source| EngineError::Template { step: step_name.to_string(), source })?;
        let Value::Object(params) = params else {
            return Err(EngineError::PlaybookInvalid(format!(
                "shard params of '{step_name}' did not render to an object"
            )));
        };

        let child = Playbook {
            metadata: noetl_playbook::Metadata {
                path: format!("{}#{}", state.catalog_id, step_name),
                name: format!("{}-shard-{}", step_name, index),
            },
            workload: state.workload.clone(),
            workbook: Default::default(),
            workflow: vec![Step {
                step: step_name.to_string(),
                tool: Some(noetl_playbook::ToolDef { kind: tool.kind.clone(), params }),
                retry: step.retry.clone(),
                output: step.output.clone(),
                auth: step.auth.clone(),
                pool: step.pool.clone(),
                ..Step::default()
            }],
        };

        // The orchestrator handle is needed to spawn the child driver.
        let this = self.self_arc()?;
        let child_id = this.submit_inner(child, Map::new(), Some(parent))?;
        self.shard_links.lock().insert(
            child_id,
            ShardLink { parent, step: step_name.to_string(), index, shard_id },
        );
        Ok(())
    }

    /// Terminal housekeeping: metrics, KV loop-state cleanup, result
    /// scope sweep, and shard fan-in notification to the parent.
    async fn finish(&self, execution_id: ExecutionId, state: &ExecutionState) {
        let duration = state
            .ended_at_ms
            .unwrap_or_else(|| self.clock.epoch_ms())
            .saturating_sub(state.started_at_ms);
        self.metrics.execution_finished(duration);

        for step in state.loop_state.keys() {
            let _ = self.kv.delete(&loop_kv_key(execution_id, step)).await;
        }

        let refs = self.collect_refs(execution_id);
        self.store.sweep_scope(&refs, ResultScope::Step).await;
        self.store.sweep_scope(&refs, ResultScope::Execution).await;
        if state.parent_execution_id.is_none() {
            self.store.sweep_scope(&refs, ResultScope::Workflow).await;
        }

        // Fan-out shard: report the terminal outcome to the parent log.
        let link = self.shard_links.lock().remove(&execution_id);
        if let Some(link) = link {
            let outcome = match state.status {
                ExecutionStatus::Completed => ShardOutcome::Succeeded,
                ExecutionStatus::Cancelled => ShardOutcome::Cancelled,
                _ => ShardOutcome::Failed,
            };
            let result_ref = state
                .step_results
                .get(&link.step)
                .and_then(|r| r.reference.as_ref())
                .map(|r| r.uri.clone());
            let record = EventRecord::new(
                link.parent,
                Event::ShardCompleted {
                    step: link.step,
                    index: link.index,
                    shard_id: link.shard_id,
                    child_execution_id: execution_id,
                    outcome,
                    result_ref,
                },
                self.clock.epoch_ms(),
            );
            if let Err(e) = self.append_with_retry(record) {
                tracing::error!(parent = %link.parent, error = %e, "fan-in report failed");
            }
        }

        self.playbooks.lock().remove(&execution_id);
        tracing::info!(execution_id = %execution_id, status = %state.status, "execution finished");
    }

    /// Every result ref recorded in the execution's events.
    fn collect_refs(&self, execution_id: ExecutionId) -> Vec<ResultRef> {
        self.log
            .events(execution_id)
            .iter()
            .filter_map(|r| match &r.event {
                Event::CallDone { result, .. } => result.reference.clone(),
                _ => None,
            })
            .collect()
    }

    /// Append, retrying transient I/O with bounded backoff. Conflicts
    /// (duplicate terminals) are absorbed; out-of-order flags are logged.
    fn append_with_retry(&self, record: EventRecord) -> Result<EventId, EngineError> {
        let mut round = 0;
        loop {
            match self.log.append(record.clone()) {
                Ok(id) => return Ok(id),
                Err(LogError::OutOfOrder { event_id }) => {
                    tracing::warn!(
                        execution_id = %record.execution_id,
                        event_id = %event_id,
                        "event appended out of order"
                    );
                    return Ok(event_id);
                }
                Err(LogError::Conflict { execution_id, step, attempt }) => {
                    tracing::debug!(
                        %execution_id,
                        step,
                        attempt,
                        "duplicate terminal event ignored"
                    );
                    return Ok(EventId::ZERO);
                }
                Err(LogError::Io(e)) if round < self.config.append_retry_limit => {
                    tracing::warn!(error = %e, round, "log append failed, retrying");
                    std::thread::sleep(Duration::from_millis(
                        self.config.append_retry_base_ms << round,
                    ));
                    round += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Recover the `Arc<Self>` for spawning child drivers.
    fn self_arc(&self) -> Result<Arc<Self>, EngineError> {
        self.weak
            .upgrade()
            .ok_or_else(|| EngineError::PlaybookInvalid("orchestrator shutting down".into()))
    }
}

/// Sub-playbook support: workers running a `playbook` tool submit through
/// the orchestrator and block on the child's terminal event.
#[async_trait::async_trait]
impl<C: Clock> noetl_worker::PlaybookHost for Orchestrator<C> {
    async fn submit_playbook(
        &self,
        playbook: Playbook,
        payload: Map<String, Value>,
        parent: ExecutionId,
    ) -> Result<ExecutionId, ToolError> {
        let this = self
            .self_arc()
            .map_err(|e| ToolError::schema(e.to_string()))?;
        this.submit_inner(playbook, payload, Some(parent))
            .map_err(|e| ToolError::schema(e.to_string()))
    }

    async fn wait_result(&self, execution_id: ExecutionId) -> Result<Value, ToolError> {
        let state = self.wait_terminal(execution_id).await;
        match state.status {
            ExecutionStatus::Completed => {
                let results: Map<String, Value> = state
                    .render_step_results()
                    .map(|(name, view)| (name.to_string(), view))
                    .collect();
                Ok(serde_json::json!({
                    "execution_id": execution_id.as_i64(),
                    "variables": state.variables,
                    "results": results,
                }))
            }
            ExecutionStatus::Cancelled => Err(ToolError::cancelled()),
            _ => {
                let error = state
                    .failure
                    .map(|f| f.error)
                    .unwrap_or_else(|| {
                        ToolError::new(
                            noetl_core::ToolErrorKind::Internal,
                            "sub-playbook failed without diagnostics",
                        )
                    });
                Err(error)
            }
        }
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
