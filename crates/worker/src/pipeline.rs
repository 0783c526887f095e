// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-worker pipelines: atomic task sequences within one command.
//!
//! Each task's result threads into `_prev`; a failure consults the
//! centralized `catch.cond` (rendered with `_err`/`_task`/`_attempt`),
//! and `finally` always runs. The whole pipeline produces exactly one
//! terminal event for its step.

use crate::executor::{ExecutionContext, ToolRegistry};
use noetl_core::ToolError;
use noetl_playbook::{CatchDef, PipeTask, Templates};
use serde_json::Value;

/// Run a pipeline to a single result or failure.
pub async fn run_pipeline(
    registry: &ToolRegistry,
    templates: &Templates,
    base_ctx: &Value,
    tasks: &[PipeTask],
    catch: Option<&CatchDef>,
    finally: Option<&PipeTask>,
    ctx: &ExecutionContext,
) -> Result<Value, ToolError> {
    let mut prev = Value::Null;
    let mut outcome: Result<Value, ToolError> = Ok(Value::Null);

    for task in tasks {
        if ctx.cancellation.is_cancelled() {
            outcome = Err(ToolError::cancelled());
            break;
        }

        match run_task(registry, templates, base_ctx, task, &prev, ctx).await {
            Ok(result) => {
                prev = result.clone();
                outcome = Ok(result);
            }
            Err(error) => {
                outcome = apply_catch(templates, base_ctx, catch, task, &prev, &error, ctx);
                break;
            }
        }
    }

    if let Some(finally_task) = finally {
        // Cleanup runs regardless of outcome; its own failure is logged,
        // never surfaced over the pipeline result.
        if let Err(e) = run_task(registry, templates, base_ctx, finally_task, &prev, ctx).await {
            tracing::warn!(step = %ctx.step, task = %finally_task.name, error = %e, "finally task failed");
        }
    }

    outcome
}

async fn run_task(
    registry: &ToolRegistry,
    templates: &Templates,
    base_ctx: &Value,
    task: &PipeTask,
    prev: &Value,
    ctx: &ExecutionContext,
) -> Result<Value, ToolError> {
    let tool = task
        .tool
        .as_ref()
        .ok_or_else(|| ToolError::schema(format!("pipeline task '{}' has no tool", task.name)))?;

    let task_ctx = pipeline_ctx(base_ctx, prev, &task.name, ctx.attempt, None);
    let payload = templates
        .render_value(&Value::Object(tool.params.clone()), &task_ctx)
        .map_err(|e| ToolError::schema(format!("task '{}' render failed: {e}", task.name)))?;

    tracing::debug!(step = %ctx.step, task = %task.name, kind = %tool.kind, "pipeline task");
    registry.execute(&tool.kind, &payload, ctx).await
}

/// Centralized catch: when `cond` is truthy for this error, the pipeline
/// recovers with the rendered `result`; otherwise the error propagates.
fn apply_catch(
    templates: &Templates,
    base_ctx: &Value,
    catch: Option<&CatchDef>,
    task: &PipeTask,
    prev: &Value,
    error: &ToolError,
    ctx: &ExecutionContext,
) -> Result<Value, ToolError> {
    let Some(catch) = catch else {
        return Err(error.clone());
    };
    let Some(cond) = catch.cond.as_deref() else {
        return Err(error.clone());
    };

    let err_json = serde_json::to_value(error).unwrap_or(Value::Null);
    let catch_ctx = pipeline_ctx(base_ctx, prev, &task.name, ctx.attempt, Some(err_json));

    if templates.truthy(cond, &catch_ctx) {
        tracing::info!(step = %ctx.step, task = %task.name, "pipeline error caught");
        let result = catch.result.clone().unwrap_or(Value::Null);
        return templates
            .render_value(&result, &catch_ctx)
            .map_err(|e| ToolError::schema(format!("catch result render failed: {e}")));
    }
    Err(error.clone())
}

fn pipeline_ctx(
    base_ctx: &Value,
    prev: &Value,
    task: &str,
    attempt: u32,
    err: Option<Value>,
) -> Value {
    let mut root = match base_ctx {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    root.insert("_prev".into(), prev.clone());
    root.insert("_task".into(), Value::String(task.to_string()));
    root.insert("_attempt".into(), Value::from(attempt));
    if let Some(err) = err {
        root.insert("_err".into(), err);
    }
    Value::Object(root)
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
