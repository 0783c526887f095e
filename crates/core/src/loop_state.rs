// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loop and fan-out bookkeeping.

use crate::id::{ExecutionId, LoopId, ShardId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How a loop's iterations are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// One iteration at a time, in input order
    #[default]
    Sequential,
    /// All iterations in flight at once, capped by the engine semaphore
    Async,
    /// Batches of elements per command
    Chunked,
    /// Each element an independent child step-run
    Fanout,
}

crate::simple_display! {
    LoopMode {
        Sequential => "sequential",
        Async => "async",
        Chunked => "chunked",
        Fanout => "fanout",
    }
}

/// Per-step loop progress, projected from iterator events and mirrored
/// into the distributed KV under `exec:{execution_id}:loop:{step}`.
///
/// `results` is index-keyed: slot `i` always corresponds to input element
/// `i`, regardless of completion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoopState {
    pub collection_size: usize,
    pub mode: LoopMode,
    pub iterator_name: String,
    pub completed_count: usize,
    /// Indexes whose iteration command has been dispatched (drives the
    /// sequential chain and the async concurrency window)
    #[serde(default)]
    pub dispatched_count: usize,
    /// Index-keyed results; `None` until the iteration completes.
    pub results: Vec<Option<Value>>,
    /// Collection descriptor from `iterator_started`; drives dispatch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collection: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<LoopId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shard_map: BTreeMap<usize, ShardStatus>,
}

impl LoopState {
    pub fn new(collection_size: usize, mode: LoopMode, iterator_name: impl Into<String>) -> Self {
        Self {
            collection_size,
            mode,
            iterator_name: iterator_name.into(),
            completed_count: 0,
            dispatched_count: 0,
            results: vec![None; collection_size],
            collection: Vec::new(),
            loop_id: None,
            shard_map: BTreeMap::new(),
        }
    }

    /// Record the result for iteration `index`. Idempotent: a second
    /// completion for the same index is ignored.
    pub fn record_result(&mut self, index: usize, result: Value) {
        if index >= self.results.len() {
            return;
        }
        if self.results[index].is_none() {
            self.results[index] = Some(result);
            self.completed_count += 1;
        }
    }

    /// All iterations have reported.
    pub fn is_complete(&self) -> bool {
        self.completed_count >= self.collection_size
    }

    /// Results in input order; missing slots surface as `Null`.
    pub fn ordered_results(&self) -> Vec<Value> {
        self.results.iter().map(|r| r.clone().unwrap_or(Value::Null)).collect()
    }
}

/// Status of one fan-out shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard_id: ShardId,
    pub child_execution_id: ExecutionId,
    pub outcome: ShardOutcome,
    /// Ref URI of the shard result, when completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardOutcome {
    #[default]
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

crate::simple_display! {
    ShardOutcome {
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

/// Engine-side counter deciding when a fan-out step is terminal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FaninTracker {
    pub loop_id: LoopId,
    pub step: String,
    pub total_expected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Permit the parent to proceed with a partial result set
    pub allow_partial: bool,
}

impl FaninTracker {
    pub fn new(loop_id: LoopId, step: impl Into<String>, total: usize, allow_partial: bool) -> Self {
        Self {
            loop_id,
            step: step.into(),
            total_expected: total,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            allow_partial,
        }
    }

    pub fn record(&mut self, outcome: ShardOutcome) {
        match outcome {
            ShardOutcome::Succeeded => self.succeeded += 1,
            ShardOutcome::Failed => self.failed += 1,
            ShardOutcome::Cancelled => self.cancelled += 1,
            ShardOutcome::Running => {}
        }
    }

    pub fn settled(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }

    /// All shards have reported (or fail-fast tripped on the first failure).
    pub fn is_terminal(&self) -> bool {
        if !self.allow_partial && self.failed > 0 {
            return true;
        }
        self.settled() >= self.total_expected
    }

    /// Fan-in status string exposed to the routing context:
    /// `complete`, `partial`, or `failed`.
    pub fn status(&self) -> &'static str {
        if self.failed == 0 && self.cancelled == 0 {
            "complete"
        } else if self.allow_partial && self.succeeded > 0 {
            "partial"
        } else {
            "failed"
        }
    }
}

#[cfg(test)]
#[path = "loop_state_tests.rs"]
mod tests;
