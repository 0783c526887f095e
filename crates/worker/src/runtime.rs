// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker loop: lease → check cancellation → resolve auth → execute →
//! externalize → emit → ack.
//!
//! Re-leases after a lease expiry mean at-least-once delivery; the log's
//! single-terminal rule absorbs the duplicates, so a late second terminal
//! event is dropped at ingest and the ack simply drains the command.

use crate::auth::KeychainResolver;
use crate::config::WorkerConfig;
use crate::executor::{ExecutionContext, ToolRegistry};
use crate::externalize::{lightweight_view, process_result};
use crate::pipeline::run_pipeline;
use noetl_core::{
    merge_pages, Clock, Command, Event, EventRecord, ExecutionId, StepResult, ToolError,
    ToolErrorKind,
};
use noetl_playbook::{CatchDef, OutputDef, PipeTask, Templates};
use noetl_queue::CommandQueue;
use noetl_storage::{DurableLog, TieredStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One worker instance, leasing from a single pool.
pub struct Worker<C: Clock> {
    log: Arc<DurableLog>,
    queue: Arc<CommandQueue<C>>,
    store: Arc<TieredStore>,
    registry: Arc<ToolRegistry>,
    resolver: Option<KeychainResolver<C>>,
    templates: Templates,
    clock: C,
    config: WorkerConfig,
}

impl<C: Clock> Worker<C> {
    pub fn new(
        log: Arc<DurableLog>,
        queue: Arc<CommandQueue<C>>,
        store: Arc<TieredStore>,
        registry: Arc<ToolRegistry>,
        clock: C,
        config: WorkerConfig,
    ) -> Self {
        Self {
            log,
            queue,
            store,
            registry,
            resolver: None,
            templates: Templates::new(),
            clock,
            config,
        }
    }

    pub fn with_resolver(mut self, resolver: KeychainResolver<C>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Poll-and-process until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(worker = %self.config.worker_id, pool = %self.config.pool, "worker started");
        loop {
            if shutdown.is_cancelled() {
                tracing::info!(worker = %self.config.worker_id, "worker stopped");
                return;
            }
            if !self.run_once().await {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                }
            }
        }
    }

    /// Lease and process at most one command. Returns false when idle.
    pub async fn run_once(&self) -> bool {
        let Some(cmd) =
            self.queue.lease(&self.config.pool, &self.config.worker_id, self.config.lease_secs)
        else {
            return false;
        };
        self.process(cmd).await;
        true
    }

    async fn process(&self, cmd: Command) {
        // Cancellation check before any work: a cancelled execution's
        // commands drain without running.
        if self.is_cancellation_requested(cmd.execution_id) {
            tracing::info!(
                execution_id = %cmd.execution_id,
                step = %cmd.step,
                "command cancelled before execution"
            );
            self.append(
                cmd.execution_id,
                Event::CommandCancelled {
                    step: cmd.step.clone(),
                    attempt: cmd.attempt,
                    queue_id: Some(cmd.queue_id),
                },
                None,
            );
            self.queue.ack(cmd.queue_id);
            return;
        }

        let is_iteration = cmd.meta.iteration.is_some();
        if !is_iteration {
            self.append(
                cmd.execution_id,
                Event::CallStarted {
                    step: cmd.step.clone(),
                    attempt: cmd.attempt,
                    node_type: cmd.node_type.clone(),
                },
                None,
            );
        }

        let started = self.clock.now();
        let outcome = self.execute_with_heartbeat(&cmd).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(raw) => self.emit_success(&cmd, raw, duration_ms).await,
            Err(error) if error.kind == ToolErrorKind::Cancelled => {
                self.append(
                    cmd.execution_id,
                    Event::CommandCancelled {
                        step: cmd.step.clone(),
                        attempt: cmd.attempt,
                        queue_id: Some(cmd.queue_id),
                    },
                    Some(duration_ms),
                );
            }
            Err(error) => {
                tracing::warn!(
                    execution_id = %cmd.execution_id,
                    step = %cmd.step,
                    attempt = cmd.attempt,
                    error = %error,
                    "tool failed"
                );
                let event = if let Some(iteration) = &cmd.meta.iteration {
                    Event::IteratorFailed {
                        step: cmd.step.clone(),
                        index: Some(iteration.index),
                        error,
                    }
                } else {
                    Event::CallFailed { step: cmd.step.clone(), attempt: cmd.attempt, error }
                };
                self.append(cmd.execution_id, event, Some(duration_ms));
            }
        }

        self.queue.ack(cmd.queue_id);
    }

    /// Execute the tool (or pipeline), extending the lease on heartbeat
    /// ticks so long-running calls survive the visibility timeout.
    async fn execute_with_heartbeat(&self, cmd: &Command) -> Result<Value, ToolError> {
        let mut ctx = ExecutionContext::new(cmd.execution_id, &cmd.step, cmd.attempt);
        if let Some(auth) = &cmd.meta.auth {
            ctx.credentials = self.resolve_auth(auth).await?;
        }

        let exec = self.invoke(cmd, &ctx);
        tokio::pin!(exec);
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                result = &mut exec => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.extend_lease(
                        cmd.queue_id,
                        &self.config.worker_id,
                        self.config.lease_secs,
                    ) {
                        tracing::warn!(queue_id = %cmd.queue_id, error = %e, "lease extension failed");
                    }
                }
            }
        }
    }

    async fn invoke(&self, cmd: &Command, ctx: &ExecutionContext) -> Result<Value, ToolError> {
        if let Some(pipeline) = &cmd.meta.pipeline {
            let tasks: Vec<PipeTask> = pipeline
                .get("tasks")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ToolError::schema(format!("invalid pipeline tasks: {e}")))?
                .unwrap_or_default();
            let catch: Option<CatchDef> = pipeline
                .get("catch")
                .cloned()
                .filter(|v| !v.is_null())
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ToolError::schema(format!("invalid pipeline catch: {e}")))?;
            let finally: Option<PipeTask> = pipeline
                .get("finally")
                .cloned()
                .filter(|v| !v.is_null())
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ToolError::schema(format!("invalid pipeline finally: {e}")))?;

            let mut base = Map::new();
            base.insert("keychain".into(), Value::Object(ctx.credentials.clone()));
            return run_pipeline(
                &self.registry,
                &self.templates,
                &Value::Object(base),
                &tasks,
                catch.as_ref(),
                finally.as_ref(),
                ctx,
            )
            .await;
        }

        self.registry.execute(&cmd.node_type, &cmd.payload, ctx).await
    }

    async fn emit_success(&self, cmd: &Command, raw: Value, duration_ms: u64) {
        let output: Option<OutputDef> = cmd
            .meta
            .output
            .clone()
            .and_then(|v| serde_json::from_value(v).ok());

        // Pagination: merge the engine-provided accumulator with this
        // page's slice so every call.done carries the running total.
        let (final_value, mut event_meta) = match &cmd.meta.pagination {
            Some(pagination) => {
                let prior = match &pagination.accumulator {
                    Some(acc) => self.load_accumulator(acc).await,
                    None => None,
                };
                let merged = merge_pages(
                    prior,
                    &raw,
                    pagination.merge_strategy,
                    pagination.merge_path.as_deref(),
                );
                let mut meta = Map::new();
                meta.insert("response".into(), raw.clone());
                meta.insert("page".into(), Value::from(cmd.attempt));
                if cmd.attempt >= pagination.max_iterations {
                    meta.insert("stopped_by".into(), Value::String("max_iterations".into()));
                }
                (merged, meta)
            }
            None => (raw, Map::new()),
        };

        let key = format!("exec:{}:{}:{}", cmd.execution_id, cmd.step, cmd.attempt);
        let result = match process_result(
            &self.store,
            &key,
            &final_value,
            output.as_ref(),
            self.config.inline_max_bytes,
            self.config.preview_max_chars,
            self.clock.epoch_ms(),
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                // Externalization failure is an infra failure for the attempt.
                self.append(
                    cmd.execution_id,
                    Event::CallFailed {
                        step: cmd.step.clone(),
                        attempt: cmd.attempt,
                        error: ToolError::new(
                            ToolErrorKind::Internal,
                            format!("result externalization failed: {e}"),
                        ),
                    },
                    Some(duration_ms),
                );
                return;
            }
        };

        let event = if let Some(iteration) = &cmd.meta.iteration {
            Event::IterationCompleted {
                step: cmd.step.clone(),
                index: iteration.index,
                result: lightweight_view(&result, output.as_ref()),
            }
        } else {
            if event_meta.contains_key("response") {
                // Keep the raw page out of the log when it externalized.
                if result.is_external() {
                    if let Some(response) = event_meta.get_mut("response") {
                        *response = summarize_response(response);
                    }
                }
            }
            Event::CallDone {
                step: cmd.step.clone(),
                attempt: cmd.attempt,
                result,
                meta: event_meta,
            }
        };
        self.append(cmd.execution_id, event, Some(duration_ms));
    }

    async fn load_accumulator(&self, acc: &StepResult) -> Option<Value> {
        if let Some(inline) = &acc.inline {
            return Some(inline.clone());
        }
        let reference = acc.reference.as_ref()?;
        match self.store.fetch(reference).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(uri = %reference.uri, error = %e, "accumulator fetch failed, restarting merge");
                None
            }
        }
    }

    async fn resolve_auth(&self, auth: &str) -> Result<Map<String, Value>, ToolError> {
        let Some(resolver) = &self.resolver else {
            return Err(ToolError::new(
                ToolErrorKind::Auth,
                format!("step requires credential '{auth}' but no resolver is configured"),
            ));
        };
        let credential = resolver.resolve(auth).await?;
        let mut map = Map::new();
        map.insert(auth.to_string(), Value::Object(credential.data));
        Ok(map)
    }

    fn is_cancellation_requested(&self, execution_id: ExecutionId) -> bool {
        self.log
            .events(execution_id)
            .iter()
            .any(|r| matches!(r.event, Event::ExecutionCancelled { .. }))
    }

    fn append(&self, execution_id: ExecutionId, event: Event, duration_ms: Option<u64>) {
        let mut record = EventRecord::new(execution_id, event, self.clock.epoch_ms());
        record.duration_ms = duration_ms;
        match self.log.append(record) {
            Ok(_) => {}
            Err(noetl_storage::LogError::Conflict { step, attempt, .. }) => {
                // Duplicate delivery after a re-lease: first terminal won.
                tracing::debug!(%execution_id, step, attempt, "duplicate terminal dropped");
            }
            Err(noetl_storage::LogError::OutOfOrder { event_id }) => {
                tracing::warn!(%execution_id, %event_id, "worker event flagged out of order");
            }
            Err(e) => {
                tracing::error!(%execution_id, error = %e, "worker event append failed");
            }
        }
    }
}

/// Truncated stand-in for an externalized page response.
fn summarize_response(response: &Value) -> Value {
    let rendered = response.to_string();
    if rendered.chars().count() <= 1024 {
        return response.clone();
    }
    let truncated: String = rendered.chars().take(1024).collect();
    Value::String(format!("{truncated}…"))
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
