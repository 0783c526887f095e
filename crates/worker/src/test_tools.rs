// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared mock executors for this crate's tests.

use crate::executor::{ExecutionContext, ToolExecutor};
use async_trait::async_trait;
use noetl_core::ToolError;
use serde_json::Value;

/// Echoes its `value` param; fails with HTTP 500 when `fail` is truthy.
pub(crate) struct EchoTool;

#[async_trait]
impl ToolExecutor for EchoTool {
    async fn execute(&self, payload: &Value, _ctx: &ExecutionContext) -> Result<Value, ToolError> {
        if payload.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ToolError::http(500, "echo told to fail"));
        }
        Ok(payload.get("value").cloned().unwrap_or(Value::Null))
    }
}
