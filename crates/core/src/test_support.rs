// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fixture helpers shared by other crates' tests.

use crate::event::{Event, EventRecord};
use crate::id::ExecutionId;
use crate::result_ref::StepResult;
use crate::tool_error::ToolError;
use serde_json::{Map, Value};

/// Record wrapping `event` at a fixed timestamp.
pub fn record(execution_id: ExecutionId, event: Event) -> EventRecord {
    EventRecord::new(execution_id, event, 1_000_000)
}

pub fn started(execution_id: ExecutionId, catalog_id: &str) -> EventRecord {
    record(
        execution_id,
        Event::ExecutionStarted {
            catalog_id: catalog_id.to_string(),
            parent_execution_id: None,
            workload: Map::new(),
        },
    )
}

pub fn call_done(execution_id: ExecutionId, step: &str, attempt: u32, value: Value) -> EventRecord {
    record(
        execution_id,
        Event::CallDone {
            step: step.to_string(),
            attempt,
            result: StepResult::inline(value),
            meta: Map::new(),
        },
    )
}

pub fn call_failed(
    execution_id: ExecutionId,
    step: &str,
    attempt: u32,
    error: ToolError,
) -> EventRecord {
    record(execution_id, Event::CallFailed { step: step.to_string(), attempt, error })
}
