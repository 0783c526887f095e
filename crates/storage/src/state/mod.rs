// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution state projected from the event log.

mod calls;
mod lifecycle;
mod loops;

use noetl_core::{
    EventRecord, ExecutionId, ExecutionStatus, FaninTracker, LoopState, StepResult, ToolError,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Terminal failure details surfaced through `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub step: String,
    pub attempt: u32,
    pub error: ToolError,
}

/// Single source of truth for one execution, derived by folding its
/// events left-to-right.
///
/// # Idempotency Requirement
///
/// **All event handlers MUST be idempotent.** Applying the same event twice
/// must produce the same state as applying it once: events may be applied
/// both for immediate visibility and again during replay.
///
/// Guidelines:
/// - Use assignment (`=`) instead of mutation (`+=`, `-=`)
/// - Guard inserts with existence checks
/// - Guard counters with settled-set membership (first terminal wins)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    pub catalog_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
    pub status: ExecutionStatus,
    /// Submit-time configuration, fixed for the execution's lifetime
    #[serde(default)]
    pub workload: Map<String, Value>,
    /// Extracted variables (`vars:` declarations and `variable.set`)
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Lightweight result view per completed step
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Highest `call.started` attempt per step
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    /// Attempts that already saw their terminal event (first wins)
    #[serde(default)]
    pub settled_attempts: BTreeMap<String, BTreeSet<u32>>,
    /// Steps with a retry scheduled: step → next attempt
    #[serde(default)]
    pub retry_pending: BTreeMap<String, u32>,
    #[serde(default)]
    pub loop_state: BTreeMap<String, LoopState>,
    /// Fan-in trackers keyed by step
    #[serde(default)]
    pub fanin: BTreeMap<String, FaninTracker>,
    #[serde(default)]
    pub cancellation_requested: bool,
    #[serde(default)]
    pub started_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub steps_entered: BTreeSet<String>,
    #[serde(default)]
    pub steps_exited: BTreeSet<String>,
    #[serde(default)]
    pub steps_failed: BTreeSet<String>,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a terminal event for `(step, attempt)` was already recorded.
    pub fn is_attempt_settled(&self, step: &str, attempt: u32) -> bool {
        self.settled_attempts.get(step).is_some_and(|s| s.contains(&attempt))
    }

    /// Render views of all completed step results, addressable by step name.
    pub fn render_step_results(&self) -> impl Iterator<Item = (&str, Value)> {
        self.step_results.iter().map(|(name, result)| (name.as_str(), result.render_view()))
    }

    /// Progress counts derived from the projection.
    pub fn progress(&self) -> (usize, usize, usize, usize) {
        let total = self.steps_entered.len();
        let completed = self.steps_exited.len();
        let failed = self.steps_failed.len();
        let running = total.saturating_sub(completed + failed);
        (total, completed, running, failed)
    }

    /// Apply an event to derive state changes.
    ///
    /// Events are facts about what happened; state is derived from those
    /// facts. Unknown event types are ignored for forward compatibility.
    pub fn apply_event(&mut self, record: &EventRecord) {
        use noetl_core::Event::*;
        match &record.event {
            ExecutionStarted { .. }
            | ExecutionCompleted
            | ExecutionFailed { .. }
            | ExecutionCancelled { .. }
            | VariableSet { .. } => lifecycle::apply(self, record),

            StepEnter { .. }
            | StepExit { .. }
            | CallStarted { .. }
            | CallDone { .. }
            | CallFailed { .. }
            | RetryScheduled { .. }
            | CommandCancelled { .. } => calls::apply(self, record),

            IteratorStarted { .. }
            | IterationStarted { .. }
            | IterationCompleted { .. }
            | IteratorCompleted { .. }
            | IteratorFailed { .. }
            | ShardCompleted { .. } => loops::apply(self, record),

            Custom => {}
        }
    }

    /// Pure projection: fold `records` into a fresh state.
    pub fn project<'a>(records: impl IntoIterator<Item = &'a EventRecord>) -> Self {
        let mut state = Self::default();
        for record in records {
            state.apply_event(record);
        }
        state
    }
}

#[cfg(test)]
#[path = "../state_tests/mod.rs"]
mod tests;
