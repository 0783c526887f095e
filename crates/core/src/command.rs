// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue commands: one work item per step attempt (or iteration / shard).

use crate::id::{EventId, ExecutionId, LoopId, QueueId, ShardId};
use crate::result_ref::StepResult;
use crate::retry::MergeStrategy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity under which duplicate enqueues collapse.
///
/// At most one command per key may be in flight at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupeKey {
    pub execution_id: ExecutionId,
    pub step: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardId>,
}

/// Iterator descriptor attached to loop-iteration commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMeta {
    pub index: usize,
    pub total: usize,
    pub iterator: String,
    /// The collection element (or chunk) this iteration processes
    pub element: Value,
}

/// Shard descriptor attached to fan-out commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub loop_id: LoopId,
    pub shard_id: ShardId,
    pub index: usize,
    pub parent_execution_id: ExecutionId,
}

/// Pagination descriptor attached to on-success continuation commands.
///
/// The worker merges the engine-provided accumulator with its page slice
/// so every `call.done` carries the up-to-date accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub merge_strategy: MergeStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_path: Option<String>,
    /// Accumulator from prior pages; absent on page 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulator: Option<StepResult>,
    pub max_iterations: u32,
}

/// Free-form command annotations the worker needs at execution time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationMeta>,
    /// Pipeline task list, when the step declares `pipe:`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Value>,
    /// The step's `output` config (selection, scope, store, thresholds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// The step's `auth` reference, resolved worker-side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// A unit of work addressed to a worker pool.
///
/// Created by the engine, consumed by exactly one worker per lease,
/// deleted when the attempt's terminal event lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub queue_id: QueueId,
    pub execution_id: ExecutionId,
    pub step: String,
    pub attempt: u32,
    pub node_type: String,
    pub target_pool: String,
    /// Rendered tool configuration
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<EventId>,
    /// Earliest lease time (epoch ms); used for scheduled retries
    #[serde(default)]
    pub available_at_ms: u64,
    #[serde(default)]
    pub meta: CommandMeta,
}

impl Command {
    pub fn new(
        execution_id: ExecutionId,
        step: impl Into<String>,
        attempt: u32,
        node_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            queue_id: QueueId::new(),
            execution_id,
            step: step.into(),
            attempt,
            node_type: node_type.into(),
            target_pool: "default".into(),
            payload,
            parent_event_id: None,
            available_at_ms: 0,
            meta: CommandMeta::default(),
        }
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        // Loop iterations share attempt 1; their index is the shard
        // discriminator so concurrent iterations never collide.
        let shard = self.meta.shard.as_ref().map(|s| s.shard_id).or_else(|| {
            self.meta
                .iteration
                .as_ref()
                .map(|it| ShardId::from_string(format!("shd-{}", it.index)))
        });
        DedupeKey {
            execution_id: self.execution_id,
            step: self.step.clone(),
            attempt: self.attempt,
            shard,
        }
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.target_pool = pool.into();
        self
    }

    pub fn available_at(mut self, epoch_ms: u64) -> Self {
        self.available_at_ms = epoch_ms;
        self
    }

    pub fn caused_by(mut self, event_id: EventId) -> Self {
        self.parent_event_id = Some(event_id);
        self
    }
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
