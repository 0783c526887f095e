// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command rendering: step templates + projected state → queue payloads.

use crate::{EngineConfig, EngineError};
use noetl_core::Command;
use noetl_playbook::{RenderContext, Step, Templates, ToolDef};
use noetl_storage::ExecutionState;
use serde_json::Value;

/// Base render context for an execution: `workload`, `vars`, and each
/// completed step's result view under its own name.
pub fn state_context(state: &ExecutionState) -> RenderContext {
    RenderContext::new()
        .workload(state.workload.clone())
        .vars(state.variables.clone())
        .step_results(state.render_step_results())
}

/// Render a step's tool into a queue command.
///
/// The payload is rendered here, at dispatch time, so the worker receives
/// concrete config; worker-side rendering is limited to pipeline-local
/// scopes.
pub fn build_command(
    state: &ExecutionState,
    step: &Step,
    tool: &ToolDef,
    attempt: u32,
    ctx: &Value,
    templates: &Templates,
    config: &EngineConfig,
) -> Result<Command, EngineError> {
    if tool.kind.is_empty() {
        return Err(EngineError::PlaybookInvalid(format!(
            "step '{}' has a tool without a kind",
            step.step
        )));
    }

    let payload = templates
        .render_value(&Value::Object(tool.params.clone()), ctx)
        .map_err(|source| EngineError::Template { step: step.step.clone(), source })?;

    let mut cmd = Command::new(state.execution_id, &step.step, attempt, &tool.kind, payload)
        .pool(step.pool.clone().unwrap_or_else(|| config.default_pool.clone()));

    if let Some(output) = &step.output {
        cmd.meta.output = serde_json::to_value(output).ok();
    }
    cmd.meta.auth = step.auth.clone();
    Ok(cmd)
}

#[cfg(test)]
#[path = "render_tests.rs"]
mod tests;
