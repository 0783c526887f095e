// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution lifecycle projection.

use super::ExecutionState;
use noetl_core::{Event, EventRecord, ExecutionStatus};

pub(super) fn apply(state: &mut ExecutionState, record: &EventRecord) {
    match &record.event {
        Event::ExecutionStarted { catalog_id, parent_execution_id, workload } => {
            // Guard: a replayed start must not reset a running execution.
            if state.status != ExecutionStatus::Pending {
                return;
            }
            state.execution_id = record.execution_id;
            state.catalog_id = catalog_id.clone();
            state.parent_execution_id = *parent_execution_id;
            state.workload = workload.clone();
            state.status = ExecutionStatus::Running;
            state.started_at_ms = record.timestamp_ms;
        }
        Event::ExecutionCompleted => {
            if !state.status.is_terminal() {
                state.status = ExecutionStatus::Completed;
                state.ended_at_ms = Some(record.timestamp_ms);
            }
        }
        Event::ExecutionFailed { step, attempt, error } => {
            if !state.status.is_terminal() {
                state.status = ExecutionStatus::Failed;
                state.ended_at_ms = Some(record.timestamp_ms);
                state.failure = Some(super::Failure {
                    step: step.clone(),
                    attempt: *attempt,
                    error: error.clone(),
                });
            }
        }
        Event::ExecutionCancelled { .. } => {
            state.cancellation_requested = true;
            if !state.status.is_terminal() {
                state.status = ExecutionStatus::Cancelled;
                state.ended_at_ms = Some(record.timestamp_ms);
            }
        }
        Event::VariableSet { name, value } => {
            state.variables.insert(name.clone(), value.clone());
        }
        _ => {}
    }
}
