// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step and call projection.

use super::ExecutionState;
use noetl_core::{Event, EventRecord};

pub(super) fn apply(state: &mut ExecutionState, record: &EventRecord) {
    match &record.event {
        Event::StepEnter { step, .. } => {
            state.current_step = Some(step.clone());
            state.steps_entered.insert(step.clone());
        }
        Event::StepExit { step, .. } => {
            state.steps_exited.insert(step.clone());
            if state.current_step.as_deref() == Some(step) {
                state.current_step = None;
            }
        }
        Event::CallStarted { step, attempt, .. } => {
            let highest = state.attempts.entry(step.clone()).or_insert(0);
            *highest = (*highest).max(*attempt);
            // A started attempt consumes any pending retry slot for it.
            if state.retry_pending.get(step) == Some(attempt) {
                state.retry_pending.remove(step);
            }
        }
        Event::CallDone { step, attempt, result, .. } => {
            if settle(state, step, *attempt) {
                state.step_results.insert(step.clone(), result.clone());
                state.steps_failed.remove(step);
            }
        }
        Event::CallFailed { step, attempt, .. } => {
            if settle(state, step, *attempt) {
                state.steps_failed.insert(step.clone());
            }
        }
        Event::RetryScheduled { step, next_attempt, .. } => {
            state.retry_pending.insert(step.clone(), *next_attempt);
            state.steps_failed.remove(step);
        }
        Event::CommandCancelled { step, attempt, .. } => {
            settle(state, step, *attempt);
        }
        _ => {}
    }
}

/// Mark `(step, attempt)` settled. Returns false when a terminal event
/// for the attempt was already recorded: duplicates are ignored, first
/// wins.
fn settle(state: &mut ExecutionState, step: &str, attempt: u32) -> bool {
    state.settled_attempts.entry(step.to_string()).or_default().insert(attempt)
}
