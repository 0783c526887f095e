// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tool executor contract and the capability registry.
//!
//! Tool kinds are an open set: the registry maps `kind` strings to
//! executors sharing one contract. Unknown kinds yield a non-retryable
//! `schema` error. Errors never escape as panics or transport failures;
//! every outcome is a `Result` the worker encodes into events.

use async_trait::async_trait;
use noetl_core::{ExecutionId, ToolError};
use noetl_playbook::Playbook;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to executors.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub step: String,
    pub attempt: u32,
    /// Cooperative cancellation; long-running tools should watch it
    pub cancellation: CancellationToken,
    pub deadline_ms: Option<u64>,
    /// Credentials resolved from the step's `auth` reference
    pub credentials: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId, step: impl Into<String>, attempt: u32) -> Self {
        Self {
            execution_id,
            step: step.into(),
            attempt,
            cancellation: CancellationToken::new(),
            deadline_ms: None,
            credentials: Map::new(),
        }
    }
}

/// One tool implementation.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, payload: &Value, ctx: &ExecutionContext) -> Result<Value, ToolError>;
}

/// Capability registry keyed by `tool.kind`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: impl Into<String>, tool: Arc<dyn ToolExecutor>) -> Self {
        self.tools.insert(kind.into(), tool);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.tools.contains_key(kind)
    }

    /// Dispatch to the executor for `kind`.
    pub async fn execute(
        &self,
        kind: &str,
        payload: &Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, ToolError> {
        let Some(tool) = self.tools.get(kind) else {
            return Err(ToolError::schema(format!("unknown tool kind: {kind}")));
        };
        if ctx.cancellation.is_cancelled() {
            return Err(ToolError::cancelled());
        }
        tool.execute(payload, ctx).await
    }
}

/// Engine surface the `playbook` tool submits through.
#[async_trait]
pub trait PlaybookHost: Send + Sync {
    async fn submit_playbook(
        &self,
        playbook: Playbook,
        payload: Map<String, Value>,
        parent: ExecutionId,
    ) -> Result<ExecutionId, ToolError>;

    /// Await the child's terminal state; returns its result view
    /// (variables plus last step result) or the failure.
    async fn wait_result(&self, execution_id: ExecutionId) -> Result<Value, ToolError>;
}

/// Sub-playbook executor: submits the nested document and blocks on the
/// child's terminal event.
pub struct PlaybookTool {
    host: Arc<dyn PlaybookHost>,
}

impl PlaybookTool {
    pub fn new(host: Arc<dyn PlaybookHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl ToolExecutor for PlaybookTool {
    async fn execute(&self, payload: &Value, ctx: &ExecutionContext) -> Result<Value, ToolError> {
        let playbook: Playbook = match payload.get("playbook") {
            Some(doc) => serde_json::from_value(doc.clone())
                .map_err(|e| ToolError::schema(format!("invalid nested playbook: {e}")))?,
            None => return Err(ToolError::schema("playbook tool requires a 'playbook' param")),
        };
        let child_payload = match payload.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        let child = self
            .host
            .submit_playbook(playbook, child_payload, ctx.execution_id)
            .await?;
        tracing::info!(parent = %ctx.execution_id, child = %child, "sub-playbook submitted");
        self.host.wait_result(child).await
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
