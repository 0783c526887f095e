// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loop and fan-out projection.

use super::ExecutionState;
use noetl_core::{Event, EventRecord, FaninTracker, LoopMode, LoopState, ShardStatus};
use serde_json::json;

pub(super) fn apply(state: &mut ExecutionState, record: &EventRecord) {
    match &record.event {
        Event::IteratorStarted { step, collection_size, mode, iterator, loop_id } => {
            // Guard: replay must not reset accumulated iteration results.
            if state.loop_state.contains_key(step) {
                return;
            }
            let mut loop_state = LoopState::new(*collection_size, *mode, iterator.clone());
            loop_state.loop_id = *loop_id;
            if let Some(collection) = record.meta.get("collection").and_then(|v| v.as_array()) {
                loop_state.collection = collection.clone();
            }
            state.loop_state.insert(step.clone(), loop_state);

            if *mode == LoopMode::Fanout {
                if let Some(loop_id) = loop_id {
                    let allow_partial = record
                        .meta
                        .get("allow_partial")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    state.fanin.entry(step.clone()).or_insert_with(|| {
                        FaninTracker::new(*loop_id, step.clone(), *collection_size, allow_partial)
                    });
                }
            }
        }
        Event::IterationStarted { step, index } => {
            if let Some(loop_state) = state.loop_state.get_mut(step) {
                loop_state.dispatched_count = loop_state.dispatched_count.max(index + 1);
            }
        }
        Event::IterationCompleted { step, index, result } => {
            if let Some(loop_state) = state.loop_state.get_mut(step) {
                loop_state.record_result(*index, result.clone());
            }
        }
        Event::IteratorCompleted { step, .. } => {
            // The loop step's result view is the index-ordered results array.
            if let Some(loop_state) = state.loop_state.get(step) {
                state.step_results.insert(
                    step.clone(),
                    noetl_core::StepResult::inline(serde_json::Value::Array(
                        loop_state.ordered_results(),
                    )),
                );
            }
        }
        Event::IteratorFailed { step, .. } => {
            state.steps_failed.insert(step.clone());
        }
        Event::ShardCompleted { step, index, shard_id, child_execution_id, outcome, result_ref } => {
            let already = state
                .loop_state
                .get(step)
                .and_then(|l| l.shard_map.get(index))
                .is_some();
            if already {
                return;
            }
            if let Some(loop_state) = state.loop_state.get_mut(step) {
                loop_state.shard_map.insert(
                    *index,
                    ShardStatus {
                        shard_id: *shard_id,
                        child_execution_id: *child_execution_id,
                        outcome: *outcome,
                        result_ref: result_ref.clone(),
                    },
                );
                loop_state.record_result(
                    *index,
                    json!({
                        "status": outcome.to_string(),
                        "execution_id": child_execution_id.as_i64(),
                        "ref": result_ref,
                    }),
                );
            }
            if let Some(tracker) = state.fanin.get_mut(step) {
                tracker.record(*outcome);
            }
        }
        _ => {}
    }
}
