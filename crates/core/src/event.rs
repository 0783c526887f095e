// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event types for the NoETL execution core

use crate::id::{EventId, ExecutionId, LoopId, QueueId, ShardId};
use crate::loop_state::{LoopMode, ShardOutcome};
use crate::result_ref::StepResult;
use crate::tool_error::ToolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Domain events recorded in the per-execution log.
///
/// Serializes with `{"type": "call.done", ...fields}` format.
/// Unknown type tags deserialize to `Custom` and project as no-ops, so
/// newer writers stay readable by older projectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- execution lifecycle --
    #[serde(rename = "execution.started")]
    ExecutionStarted {
        catalog_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_execution_id: Option<ExecutionId>,
        #[serde(default)]
        workload: Map<String, Value>,
    },

    #[serde(rename = "execution.completed")]
    ExecutionCompleted,

    #[serde(rename = "execution.failed")]
    ExecutionFailed {
        step: String,
        attempt: u32,
        error: ToolError,
    },

    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default)]
        cascade: bool,
    },

    // -- step --
    #[serde(rename = "step.enter")]
    StepEnter { step: String, node_type: String },

    #[serde(rename = "step.exit")]
    StepExit {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },

    // -- call (one step attempt) --
    #[serde(rename = "call.started")]
    CallStarted {
        step: String,
        attempt: u32,
        node_type: String,
    },

    #[serde(rename = "call.done")]
    CallDone {
        step: String,
        attempt: u32,
        result: StepResult,
        /// Attempt-local annotations (e.g. `stopped_by`)
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        meta: Map<String, Value>,
    },

    #[serde(rename = "call.failed")]
    CallFailed {
        step: String,
        attempt: u32,
        error: ToolError,
    },

    // -- loops --
    #[serde(rename = "iterator_started")]
    IteratorStarted {
        step: String,
        collection_size: usize,
        mode: LoopMode,
        iterator: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_id: Option<LoopId>,
    },

    #[serde(rename = "iteration_started")]
    IterationStarted { step: String, index: usize },

    #[serde(rename = "iteration_completed")]
    IterationCompleted {
        step: String,
        index: usize,
        result: Value,
    },

    #[serde(rename = "iterator_completed")]
    IteratorCompleted {
        step: String,
        count: usize,
        #[serde(default)]
        partial: bool,
    },

    #[serde(rename = "iterator_failed")]
    IteratorFailed {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        error: ToolError,
    },

    /// A fan-out shard's child execution reached a terminal state
    #[serde(rename = "shard.completed")]
    ShardCompleted {
        step: String,
        index: usize,
        shard_id: ShardId,
        child_execution_id: ExecutionId,
        outcome: ShardOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_ref: Option<String>,
    },

    // -- retries & cancellation --
    #[serde(rename = "retry_scheduled")]
    RetryScheduled {
        step: String,
        next_attempt: u32,
        delay_ms: u64,
        reason: String,
    },

    #[serde(rename = "command.cancelled")]
    CommandCancelled {
        step: String,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue_id: Option<QueueId>,
    },

    // -- control --
    #[serde(rename = "variable.set")]
    VariableSet { name: String, value: Value },

    /// Catch-all for unknown event types (extensibility)
    #[serde(other, skip_serializing)]
    Custom,
}

impl Event {
    /// The step this event concerns, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Event::StepEnter { step, .. }
            | Event::StepExit { step, .. }
            | Event::CallStarted { step, .. }
            | Event::CallDone { step, .. }
            | Event::CallFailed { step, .. }
            | Event::IteratorStarted { step, .. }
            | Event::IterationStarted { step, .. }
            | Event::IterationCompleted { step, .. }
            | Event::IteratorCompleted { step, .. }
            | Event::IteratorFailed { step, .. }
            | Event::ShardCompleted { step, .. }
            | Event::RetryScheduled { step, .. }
            | Event::CommandCancelled { step, .. } => Some(step),
            Event::ExecutionFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    /// The attempt number this event concerns, if any.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Event::CallStarted { attempt, .. }
            | Event::CallDone { attempt, .. }
            | Event::CallFailed { attempt, .. }
            | Event::CommandCancelled { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    /// `(step, attempt)` when this event is terminal for one attempt.
    ///
    /// At most one terminal event per key may be recorded (first wins).
    pub fn terminal_key(&self) -> Option<(&str, u32)> {
        match self {
            Event::CallDone { step, attempt, .. } | Event::CallFailed { step, attempt, .. } => {
                Some((step, *attempt))
            }
            _ => None,
        }
    }

    /// True for events that end the whole execution.
    pub fn is_execution_terminal(&self) -> bool {
        matches!(
            self,
            Event::ExecutionCompleted
                | Event::ExecutionFailed { .. }
                | Event::ExecutionCancelled { .. }
        )
    }

    /// Serialized tag name (e.g. `call.done`).
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ExecutionStarted { .. } => "execution.started",
            Event::ExecutionCompleted => "execution.completed",
            Event::ExecutionFailed { .. } => "execution.failed",
            Event::ExecutionCancelled { .. } => "execution.cancelled",
            Event::StepEnter { .. } => "step.enter",
            Event::StepExit { .. } => "step.exit",
            Event::CallStarted { .. } => "call.started",
            Event::CallDone { .. } => "call.done",
            Event::CallFailed { .. } => "call.failed",
            Event::IteratorStarted { .. } => "iterator_started",
            Event::IterationStarted { .. } => "iteration_started",
            Event::IterationCompleted { .. } => "iteration_completed",
            Event::IteratorCompleted { .. } => "iterator_completed",
            Event::IteratorFailed { .. } => "iterator_failed",
            Event::ShardCompleted { .. } => "shard.completed",
            Event::RetryScheduled { .. } => "retry_scheduled",
            Event::CommandCancelled { .. } => "command.cancelled",
            Event::VariableSet { .. } => "variable.set",
            Event::Custom => "custom",
        }
    }

    /// One-line summary for log spans.
    pub fn log_summary(&self) -> String {
        match (self.step(), self.attempt()) {
            (Some(step), Some(attempt)) => {
                format!("{} step={} attempt={}", self.type_name(), step, attempt)
            }
            (Some(step), None) => format!("{} step={}", self.type_name(), step),
            _ => self.type_name().to_string(),
        }
    }
}

/// Append-only envelope around an [`Event`].
///
/// Records are never mutated; ordering within an execution is total and
/// follows `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub execution_id: ExecutionId,
    /// Set for retries and other caused-by chains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<EventId>,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(flatten)]
    pub event: Event,
    /// Log-level annotations (e.g. `out_of_order`, duplicate flags)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl EventRecord {
    /// New unsequenced record; the log assigns `event_id` on append.
    pub fn new(execution_id: ExecutionId, event: Event, timestamp_ms: u64) -> Self {
        Self {
            event_id: EventId::ZERO,
            execution_id,
            parent_event_id: None,
            timestamp_ms,
            duration_ms: None,
            event,
            meta: Map::new(),
        }
    }

    pub fn caused_by(mut self, parent: EventId) -> Self {
        self.parent_event_id = Some(parent);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
