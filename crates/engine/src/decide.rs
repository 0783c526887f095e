// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The decision function: `(state, event) → actions`.
//!
//! Pure: all side effects are expressed as [`Action`]s for the
//! orchestrator to execute in order. Replaying the same state and event
//! yields the same decisions (jitter and clock readings arrive through
//! [`DecisionCtx`]).

use crate::render::{build_command, state_context};
use crate::{Action, EngineConfig, EngineError};
use noetl_core::{
    Event, EventRecord, IterationMeta, LoopMode, PaginationMeta, ShardId, StepResult, ToolError,
    ToolErrorKind,
};
use noetl_playbook::{ElseAction, NextRule, Playbook, Step, Templates};
use noetl_storage::{loop_kv_key, ExecutionState};
use serde_json::{json, Map, Value};

/// Per-decision inputs beyond the state and event.
pub struct DecisionCtx<'a> {
    pub playbook: &'a Playbook,
    pub templates: &'a Templates,
    pub config: &'a EngineConfig,
    pub now_ms: u64,
    /// Sampled uniform [0.5, 1.5]; applied only when a policy asks for jitter
    pub jitter: f64,
}

/// Evaluate one event against the current projection.
///
/// The state has already absorbed `record` (apply-then-decide).
pub fn decide(
    state: &ExecutionState,
    record: &EventRecord,
    ctx: &DecisionCtx<'_>,
) -> Result<Vec<Action>, EngineError> {
    match &record.event {
        Event::ExecutionStarted { .. } => on_execution_started(state, ctx),
        Event::StepEnter { step, .. } => on_step_enter(state, ctx, step),
        Event::CallDone { step, attempt, result, meta } => {
            on_call_done(state, ctx, step, *attempt, result, meta)
        }
        Event::CallFailed { step, attempt, error } => {
            on_call_failed(state, ctx, step, *attempt, error)
        }
        Event::IteratorStarted { step, collection_size, mode, .. } => {
            on_iterator_started(state, ctx, step, *collection_size, *mode)
        }
        Event::IterationCompleted { step, index, result } => {
            on_iteration_completed(state, ctx, step, *index, result)
        }
        Event::IteratorCompleted { step, .. } => on_iterator_completed(state, ctx, step),
        Event::IteratorFailed { step, error, .. } => on_iterator_failed(state, ctx, step, error),
        Event::ShardCompleted { step, .. } => on_shard_completed(state, ctx, step),
        Event::ExecutionCancelled { cascade, .. } => {
            Ok(vec![Action::CancelCommands { cascade: *cascade }])
        }

        // Observed but decision-neutral
        Event::ExecutionCompleted
        | Event::ExecutionFailed { .. }
        | Event::StepExit { .. }
        | Event::CallStarted { .. }
        | Event::IterationStarted { .. }
        | Event::RetryScheduled { .. }
        | Event::CommandCancelled { .. }
        | Event::VariableSet { .. }
        | Event::Custom => Ok(Vec::new()),
    }
}

fn step_def<'a>(ctx: &DecisionCtx<'a>, name: &str) -> Result<&'a Step, EngineError> {
    ctx.playbook.step(name).ok_or_else(|| EngineError::StepNotFound(name.to_string()))
}

fn base_ctx(state: &ExecutionState) -> Value {
    state_context(state).build()
}

/// What kind of node a step is, for `step.enter` events.
fn node_type(playbook: &Playbook, step: &Step) -> String {
    if let Some(tool) = playbook.resolve_tool(step) {
        if step.has_loop() {
            return format!("loop:{}", tool.kind);
        }
        return tool.kind;
    }
    if step.has_pipeline() {
        "pipeline".to_string()
    } else {
        "route".to_string()
    }
}

fn enter(playbook: &Playbook, step: &Step) -> Action {
    Action::append(Event::StepEnter {
        step: step.step.clone(),
        node_type: node_type(playbook, step),
    })
}

fn on_execution_started(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
) -> Result<Vec<Action>, EngineError> {
    let Some(start) = ctx.playbook.start() else {
        return Ok(vec![Action::append(Event::ExecutionFailed {
            step: String::new(),
            attempt: 0,
            error: ToolError::schema("playbook has an empty workflow"),
        })]);
    };

    if start.is_routing_only() {
        // Routing-only start: evaluate its transitions without entering it.
        return route(state, ctx, start, &base_ctx(state), &Map::new(), false);
    }
    Ok(vec![enter(ctx.playbook, start)])
}

fn on_step_enter(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    name: &str,
) -> Result<Vec<Action>, EngineError> {
    if state.cancellation_requested {
        return Ok(Vec::new());
    }
    let step = step_def(ctx, name)?;

    if step.has_loop() {
        return start_iterator(state, ctx, step);
    }

    if step.has_pipeline() {
        let mut cmd = noetl_core::Command::new(
            state.execution_id,
            &step.step,
            1,
            "pipeline",
            json!({}),
        )
        .pool(step.pool.clone().unwrap_or_else(|| ctx.config.default_pool.clone()));
        // Resolve workbook references now; the worker has no playbook.
        let resolve = |task: &noetl_playbook::PipeTask| {
            let mut task = task.clone();
            if task.tool.is_none() {
                if let Some(name) = &task.task {
                    task.tool = ctx.playbook.workbook.get(name).cloned();
                }
            }
            task
        };
        let tasks: Vec<noetl_playbook::PipeTask> = step.pipe.iter().map(resolve).collect();
        cmd.meta.pipeline = Some(json!({
            "tasks": tasks,
            "catch": step.catch,
            "finally": step.finally.as_ref().map(resolve),
        }));
        if let Some(output) = &step.output {
            cmd.meta.output = serde_json::to_value(output).ok();
        }
        cmd.meta.auth = step.auth.clone();
        return Ok(vec![Action::Enqueue(cmd)]);
    }

    if let Some(tool) = ctx.playbook.resolve_tool(step) {
        let ctx_value = base_ctx(state);
        let mut cmd = build_command(state, step, &tool, 1, &ctx_value, ctx.templates, ctx.config)?;
        if let Some(policy) = &step.pagination {
            cmd.meta.pagination = Some(PaginationMeta {
                merge_strategy: policy.merge_strategy,
                merge_path: policy.merge_path.clone(),
                accumulator: None,
                max_iterations: policy.max_iterations,
            });
        }
        return Ok(vec![Action::Enqueue(cmd)]);
    }

    // Routing-only step
    route(state, ctx, step, &base_ctx(state), &Map::new(), true)
}

fn on_call_done(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    name: &str,
    attempt: u32,
    result: &StepResult,
    event_meta: &Map<String, Value>,
) -> Result<Vec<Action>, EngineError> {
    let step = step_def(ctx, name)?;

    // On-success continuation (pagination)
    if let Some(policy) = &step.pagination {
        let response = event_meta
            .get("response")
            .cloned()
            .unwrap_or_else(|| result.render_view());
        let page_ctx = state_context(state).response(response.clone()).build();

        if !state.cancellation_requested
            && policy.allows_page(attempt)
            && ctx.templates.truthy(&policy.continue_while, &page_ctx)
        {
            let tool = ctx
                .playbook
                .resolve_tool(step)
                .ok_or_else(|| EngineError::PlaybookInvalid(format!("paginated step '{name}' has no tool")))?;
            let mut cmd = build_command(
                state,
                step,
                &tool,
                attempt + 1,
                &base_ctx(state),
                ctx.templates,
                ctx.config,
            )?;
            for (path, expr) in &policy.next_page {
                let value = ctx.templates.eval(expr, &page_ctx).unwrap_or(Value::Null);
                noetl_core::set_path(&mut cmd.payload, path, value);
            }
            cmd.meta.pagination = Some(PaginationMeta {
                merge_strategy: policy.merge_strategy,
                merge_path: policy.merge_path.clone(),
                accumulator: Some(result.clone()),
                max_iterations: policy.max_iterations,
            });
            return Ok(vec![Action::Enqueue(cmd)]);
        }
    }

    // Consume vars: extractions, then route
    let mut ctx_value = state_context(state).response(result.render_view());
    if let Some(tracker) = state.fanin.get(name) {
        ctx_value = ctx_value.fanin(json!({
            "status": tracker.status(),
            "succeeded": tracker.succeeded,
            "failed": tracker.failed,
            "total": tracker.total_expected,
        }));
    }
    let ctx_value = ctx_value.build();

    let (mut actions, extracted) = extract_vars(ctx, step, &ctx_value);
    actions.extend(route(state, ctx, step, &ctx_value, &extracted, true)?);
    Ok(actions)
}

fn on_call_failed(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    name: &str,
    attempt: u32,
    error: &ToolError,
) -> Result<Vec<Action>, EngineError> {
    if state.cancellation_requested {
        return Ok(Vec::new());
    }
    let step = step_def(ctx, name)?;
    let err_ctx = error_context(state, error);

    if let Some(policy) = &step.retry {
        let stopped =
            policy.stop_when.as_deref().is_some_and(|expr| ctx.templates.truthy(expr, &err_ctx));
        let eligible = match policy.retry_when.as_deref() {
            Some(expr) => ctx.templates.truthy(expr, &err_ctx),
            None => error.retryable,
        };

        if !stopped && eligible && policy.allows_retry(attempt) {
            let delay_ms = policy.delay_ms_after(attempt, ctx.jitter);
            let tool = ctx
                .playbook
                .resolve_tool(step)
                .ok_or_else(|| EngineError::PlaybookInvalid(format!("retried step '{name}' has no tool")))?;
            let cmd = build_command(
                state,
                step,
                &tool,
                attempt + 1,
                &base_ctx(state),
                ctx.templates,
                ctx.config,
            )?
            .available_at(ctx.now_ms + delay_ms);

            return Ok(vec![
                Action::append(Event::RetryScheduled {
                    step: name.to_string(),
                    next_attempt: attempt + 1,
                    delay_ms,
                    reason: error.kind.to_string(),
                }),
                Action::Enqueue(cmd),
            ]);
        }
    }

    fail_or_branch(ctx, step, attempt, error, &err_ctx)
}

/// Error routing shared by terminal call failures and iterator failures:
/// a matching `case` arm routes, `case.else do: fail` (or no branch at
/// all) propagates as `execution.failed`.
fn fail_or_branch(
    ctx: &DecisionCtx<'_>,
    step: &Step,
    attempt: u32,
    error: &ToolError,
    err_ctx: &Value,
) -> Result<Vec<Action>, EngineError> {
    let matched = step
        .case
        .iter()
        .find(|arm| arm.when.as_deref().is_some_and(|w| ctx.templates.truthy(w, err_ctx)));
    if let Some(arm) = matched {
        if !arm.is_fail() {
            if let Some(target) = arm.target() {
                return route_to(ctx, step, arm, target, err_ctx);
            }
        }
    } else if let Some(action) = step.case_else() {
        match action {
            ElseAction::Fail => {}
            ElseAction::Route(target) => {
                let arm = step
                    .case
                    .iter()
                    .find(|r| r.is_else())
                    .ok_or_else(|| EngineError::PlaybookInvalid("else arm vanished".into()))?;
                return route_to(ctx, step, arm, &target, err_ctx);
            }
        }
    }

    Ok(vec![Action::append(Event::ExecutionFailed {
        step: step.step.clone(),
        attempt,
        error: error.clone(),
    })])
}

fn on_iterator_started(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    name: &str,
    collection_size: usize,
    mode: LoopMode,
) -> Result<Vec<Action>, EngineError> {
    if state.cancellation_requested {
        return Ok(Vec::new());
    }
    let step = step_def(ctx, name)?;

    // Empty collection completes immediately and routes onward.
    if collection_size == 0 {
        return Ok(vec![Action::append(Event::IteratorCompleted {
            step: name.to_string(),
            count: 0,
            partial: false,
        })]);
    }

    match mode {
        LoopMode::Sequential | LoopMode::Chunked => dispatch_iteration(state, ctx, step, 0),
        LoopMode::Async => {
            let window = collection_size.min(ctx.config.async_concurrency);
            let mut actions = Vec::new();
            for index in 0..window {
                actions.extend(dispatch_iteration(state, ctx, step, index)?);
            }
            Ok(actions)
        }
        LoopMode::Fanout => {
            let Some(loop_state) = state.loop_state.get(name) else {
                return Ok(Vec::new());
            };
            let actions = loop_state
                .collection
                .iter()
                .enumerate()
                .map(|(index, element)| Action::SubmitShard {
                    step: name.to_string(),
                    index,
                    shard_id: ShardId::from_string(format!("shd-{index}")),
                    element: element.clone(),
                })
                .collect();
            Ok(actions)
        }
    }
}

/// Render and enqueue one loop iteration.
fn dispatch_iteration(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    step: &Step,
    index: usize,
) -> Result<Vec<Action>, EngineError> {
    let Some(loop_state) = state.loop_state.get(&step.step) else {
        return Ok(Vec::new());
    };
    let Some(element) = loop_state.collection.get(index).cloned() else {
        return Ok(Vec::new());
    };
    let loop_def = step
        .loop_def
        .as_ref()
        .ok_or_else(|| EngineError::PlaybookInvalid(format!("step '{}' lost its loop", step.step)))?;
    let tool = ctx
        .playbook
        .resolve_tool(step)
        .ok_or_else(|| EngineError::PlaybookInvalid(format!("loop step '{}' has no tool", step.step)))?;

    let ctx_value = state_context(state)
        .iterator(&loop_def.iterator, element.clone(), index)
        .build();
    let mut cmd = build_command(state, step, &tool, 1, &ctx_value, ctx.templates, ctx.config)?;
    cmd.meta.iteration = Some(IterationMeta {
        index,
        total: loop_state.collection_size,
        iterator: loop_def.iterator.clone(),
        element,
    });

    Ok(vec![
        Action::append(Event::IterationStarted { step: step.step.clone(), index }),
        Action::Enqueue(cmd),
    ])
}

fn on_iteration_completed(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    name: &str,
    index: usize,
    result: &Value,
) -> Result<Vec<Action>, EngineError> {
    let step = step_def(ctx, name)?;
    let Some(loop_state) = state.loop_state.get(name) else {
        return Ok(Vec::new());
    };

    let mut actions = vec![Action::AppendLoopResult {
        key: loop_kv_key(state.execution_id, name),
        index,
        value: result.clone(),
    }];

    if loop_state.is_complete() {
        actions.push(Action::append(Event::IteratorCompleted {
            step: name.to_string(),
            count: loop_state.completed_count,
            partial: false,
        }));
        return Ok(actions);
    }

    if state.cancellation_requested {
        return Ok(actions);
    }

    // Sequential chains one at a time; async refills its window.
    let next = loop_state.dispatched_count;
    if next < loop_state.collection_size {
        actions.extend(dispatch_iteration(state, ctx, step, next)?);
    }
    Ok(actions)
}

fn on_iterator_completed(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    name: &str,
) -> Result<Vec<Action>, EngineError> {
    // Fan-out steps route from the manifest `call.done` instead.
    if state.fanin.contains_key(name) {
        return Ok(Vec::new());
    }
    let step = step_def(ctx, name)?;

    let results = state
        .loop_state
        .get(name)
        .map(|l| Value::Array(l.ordered_results()))
        .unwrap_or(Value::Array(Vec::new()));
    let ctx_value = state_context(state).response(results).build();

    let (mut actions, extracted) = extract_vars(ctx, step, &ctx_value);
    actions.extend(route(state, ctx, step, &ctx_value, &extracted, true)?);
    Ok(actions)
}

fn on_iterator_failed(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    name: &str,
    error: &ToolError,
) -> Result<Vec<Action>, EngineError> {
    if state.cancellation_requested {
        return Ok(Vec::new());
    }
    let step = step_def(ctx, name)?;
    let attempt = state.attempts.get(name).copied().unwrap_or(1);
    let err_ctx = error_context(state, error);
    fail_or_branch(ctx, step, attempt, error, &err_ctx)
}

fn on_shard_completed(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    name: &str,
) -> Result<Vec<Action>, EngineError> {
    step_def(ctx, name)?;
    // Fail-fast already tripped for this step.
    if state.steps_failed.contains(name) {
        return Ok(Vec::new());
    }
    let Some(tracker) = state.fanin.get(name) else {
        return Ok(Vec::new());
    };

    if !tracker.allow_partial && tracker.failed > 0 {
        return Ok(vec![
            Action::CancelShards { step: name.to_string() },
            Action::append(Event::IteratorFailed {
                step: name.to_string(),
                index: None,
                error: ToolError::new(
                    ToolErrorKind::Internal,
                    format!("{} of {} shards failed", tracker.failed, tracker.total_expected),
                ),
            }),
        ]);
    }

    if tracker.settled() < tracker.total_expected {
        return Ok(Vec::new());
    }

    // Fan-in complete: emit the manifest as the parent step's result.
    let shards: Vec<Value> = state
        .loop_state
        .get(name)
        .map(|l| {
            l.shard_map
                .iter()
                .map(|(index, shard)| {
                    json!({
                        "index": index,
                        "shard_id": shard.shard_id,
                        "execution_id": shard.child_execution_id.as_i64(),
                        "status": shard.outcome.to_string(),
                        "ref": shard.result_ref,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let manifest = json!({
        "status": tracker.status(),
        "succeeded": tracker.succeeded,
        "failed": tracker.failed,
        "total": tracker.total_expected,
        "shards": shards,
    });

    Ok(vec![
        Action::append(Event::IteratorCompleted {
            step: name.to_string(),
            count: tracker.settled(),
            partial: tracker.failed > 0,
        }),
        Action::append(Event::CallDone {
            step: name.to_string(),
            attempt: 1,
            result: StepResult::inline(manifest),
            meta: Map::new(),
        }),
    ])
}

/// Evaluate a step's `vars:` extractions. Returns the `variable.set`
/// actions plus the extracted map (overlaid onto routing conditions so
/// they see the new values before projection catches up).
fn extract_vars(
    ctx: &DecisionCtx<'_>,
    step: &Step,
    ctx_value: &Value,
) -> (Vec<Action>, Map<String, Value>) {
    let mut actions = Vec::new();
    let mut extracted = Map::new();
    for (name, expr) in &step.vars {
        let value = match ctx.templates.eval(expr, ctx_value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(step = %step.step, var = %name, error = %e, "vars extraction failed");
                Value::Null
            }
        };
        extracted.insert(name.clone(), value.clone());
        actions.push(Action::append(Event::VariableSet { name: name.clone(), value }));
    }
    (actions, extracted)
}

/// Evaluate `next` (or `case`, when `next` is absent) and produce the
/// exit/enter/terminal actions.
fn route(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    step: &Step,
    ctx_value: &Value,
    extracted: &Map<String, Value>,
    emit_exit: bool,
) -> Result<Vec<Action>, EngineError> {
    let rules = if step.next.is_empty() { &step.case } else { &step.next };

    // Routing conditions see freshly extracted vars.
    let routing_ctx = overlay_vars(ctx_value, extracted);

    let chosen = rules
        .iter()
        .find(|rule| rule.when.as_deref().is_some_and(|w| ctx.templates.truthy(w, &routing_ctx)))
        .or_else(|| rules.iter().find(|rule| rule.is_else()));

    let exit = |next: Option<String>| {
        Action::append(Event::StepExit { step: step.step.clone(), next })
    };

    match chosen {
        None => {
            // Terminal step (or no matching transition): the execution drains.
            let mut actions = Vec::new();
            if emit_exit {
                actions.push(exit(None));
            }
            actions.push(Action::append(Event::ExecutionCompleted));
            Ok(actions)
        }
        Some(rule) if rule.is_fail() => {
            let mut actions = Vec::new();
            if emit_exit {
                actions.push(exit(None));
            }
            let attempt = state.attempts.get(step.step.as_str()).copied().unwrap_or(1);
            actions.push(Action::append(Event::ExecutionFailed {
                step: step.step.clone(),
                attempt,
                error: ToolError::new(ToolErrorKind::Internal, "routed to fail"),
            }));
            Ok(actions)
        }
        Some(rule) => {
            let target = rule
                .target()
                .ok_or_else(|| EngineError::PlaybookInvalid(format!(
                    "transition out of '{}' names no target",
                    step.step
                )))?
                .to_string();
            let target_def = step_def(ctx, &target)?;

            let mut actions = Vec::new();
            if emit_exit {
                actions.push(exit(Some(target.clone())));
            }
            for (name, value) in &rule.data {
                let rendered = ctx
                    .templates
                    .render_value(value, &routing_ctx)
                    .unwrap_or_else(|_| value.clone());
                actions.push(Action::append(Event::VariableSet {
                    name: name.clone(),
                    value: rendered,
                }));
            }
            actions.push(enter(ctx.playbook, target_def));
            Ok(actions)
        }
    }
}

/// Route from an error branch arm to its target.
fn route_to(
    ctx: &DecisionCtx<'_>,
    step: &Step,
    arm: &NextRule,
    target: &str,
    err_ctx: &Value,
) -> Result<Vec<Action>, EngineError> {
    let target_def = step_def(ctx, target)?;
    let mut actions = vec![Action::append(Event::StepExit {
        step: step.step.clone(),
        next: Some(target.to_string()),
    })];
    for (name, value) in &arm.data {
        let rendered =
            ctx.templates.render_value(value, err_ctx).unwrap_or_else(|_| value.clone());
        actions.push(Action::append(Event::VariableSet { name: name.clone(), value: rendered }));
    }
    actions.push(enter(ctx.playbook, target_def));
    Ok(actions)
}

/// Context for retry/stop conditions and error branches: the error object
/// under `_err` plus its fields at top level (`status_code`, `kind`, …).
fn error_context(state: &ExecutionState, error: &ToolError) -> Value {
    let err_json = serde_json::to_value(error).unwrap_or(Value::Null);
    let mut top = Map::new();
    top.insert("kind".into(), json!(error.kind.to_string()));
    top.insert("message".into(), json!(error.message));
    if let Some(status) = error.http_status {
        top.insert("status_code".into(), json!(status));
    }
    if let Some(code) = &error.pg_code {
        top.insert("pg_code".into(), json!(code));
    }
    state_context(state).error(err_json).data(&top).build()
}

/// Overlay freshly extracted vars onto the context's `vars` scope.
fn overlay_vars(ctx_value: &Value, extracted: &Map<String, Value>) -> Value {
    if extracted.is_empty() {
        return ctx_value.clone();
    }
    let mut merged = ctx_value.clone();
    if let Value::Object(root) = &mut merged {
        let vars = root.entry("vars").or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(vars) = vars {
            for (k, v) in extracted {
                vars.insert(k.clone(), v.clone());
            }
        }
    }
    merged
}

/// Iterator setup for a loop-bearing step: resolve the collection, emit
/// `iterator_started` (collection rides in the record meta), and mirror
/// the initial loop state to the KV.
fn start_iterator(
    state: &ExecutionState,
    ctx: &DecisionCtx<'_>,
    step: &Step,
) -> Result<Vec<Action>, EngineError> {
    let loop_def = step
        .loop_def
        .as_ref()
        .ok_or_else(|| EngineError::PlaybookInvalid(format!("step '{}' lost its loop", step.step)))?;

    let ctx_value = base_ctx(state);
    let elements = match &loop_def.collection {
        Value::String(expr) => ctx
            .templates
            .eval(expr, &ctx_value)
            .map_err(|source| EngineError::Template { step: step.step.clone(), source })?,
        other => ctx
            .templates
            .render_value(other, &ctx_value)
            .map_err(|source| EngineError::Template { step: step.step.clone(), source })?,
    };
    let Value::Array(elements) = elements else {
        return Err(EngineError::PlaybookInvalid(format!(
            "loop collection of '{}' is not an array",
            step.step
        )));
    };

    // Iterations are elements, chunks, or shards depending on mode.
    let mode = loop_def.mode;
    let units: Vec<Value> = match mode {
        LoopMode::Sequential | LoopMode::Async => elements,
        LoopMode::Chunked => {
            let size = loop_def.chunk_size.unwrap_or(ctx.config.default_chunk_size).max(1);
            elements.chunks(size).map(|chunk| Value::Array(chunk.to_vec())).collect()
        }
        LoopMode::Fanout => {
            let size = step.fanout.as_ref().map(|f| f.shard_size).unwrap_or(1).max(1);
            if size == 1 {
                elements
            } else {
                elements.chunks(size).map(|chunk| Value::Array(chunk.to_vec())).collect()
            }
        }
    };

    let count = units.len();
    let mut meta = Map::new();
    meta.insert("collection".into(), Value::Array(units));
    let loop_id = if mode == LoopMode::Fanout {
        let allow_partial = step.fanout.as_ref().map(|f| f.allow_partial).unwrap_or(false);
        meta.insert("allow_partial".into(), Value::Bool(allow_partial));
        // Deterministic so replayed decisions agree.
        Some(noetl_core::LoopId::from_string(noetl_core::short(
            &format!("loop{}-{}", state.execution_id, step.step),
            22,
        )))
    } else {
        None
    };

    let initial = serde_json::to_value(noetl_core::LoopState::new(
        count,
        mode,
        loop_def.iterator.clone(),
    ))
    .unwrap_or(Value::Null);

    Ok(vec![
        Action::Append {
            event: Event::IteratorStarted {
                step: step.step.clone(),
                collection_size: count,
                mode,
                iterator: loop_def.iterator.clone(),
                loop_id,
            },
            meta,
        },
        Action::MirrorLoop { key: loop_kv_key(state.execution_id, &step.step), value: initial },
    ])
}

#[cfg(test)]
#[path = "decide_tests.rs"]
mod tests;
