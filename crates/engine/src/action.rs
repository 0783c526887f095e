// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Actions the decision function hands to the orchestrator.
//!
//! Decisions are pure; every side effect (log append, enqueue, KV write,
//! child submit) is expressed as an [`Action`] and executed in order.

use noetl_core::{Command, Event, ShardId};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Append an event to the execution's log
    Append {
        event: Event,
        /// Record-level annotations (e.g. `collection`, `allow_partial`)
        meta: Map<String, Value>,
    },

    /// Hand a command to the queue (respects `available_at`)
    Enqueue(Command),

    /// Mirror loop state into the distributed KV
    MirrorLoop { key: String, value: Value },

    /// Atomic append-by-index into the KV-mirrored loop results
    AppendLoopResult {
        key: String,
        index: usize,
        value: Value,
    },

    /// Drop queued commands for this execution and flag leased ones;
    /// cascade recursively cancels child executions
    CancelCommands { cascade: bool },

    /// Launch one fan-out shard as a child execution
    SubmitShard {
        step: String,
        index: usize,
        shard_id: ShardId,
        element: Value,
    },

    /// Cancel the still-running shard children of a fan-out step
    CancelShards { step: String },
}

impl Action {
    /// Action name for log spans
    pub fn name(&self) -> &'static str {
        match self {
            Action::Append { .. } => "append",
            Action::Enqueue(_) => "enqueue",
            Action::MirrorLoop { .. } => "mirror_loop",
            Action::AppendLoopResult { .. } => "append_loop_result",
            Action::CancelCommands { .. } => "cancel_commands",
            Action::SubmitShard { .. } => "submit_shard",
            Action::CancelShards { .. } => "cancel_shards",
        }
    }

    /// Key-value pairs for structured logging
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            Action::Append { event, .. } => vec![("event", event.log_summary())],
            Action::Enqueue(cmd) => vec![
                ("step", cmd.step.clone()),
                ("attempt", cmd.attempt.to_string()),
                ("pool", cmd.target_pool.clone()),
                ("available_at_ms", cmd.available_at_ms.to_string()),
            ],
            Action::MirrorLoop { key, .. } => vec![("key", key.clone())],
            Action::AppendLoopResult { key, index, .. } => {
                vec![("key", key.clone()), ("index", index.to_string())]
            }
            Action::CancelCommands { cascade } => vec![("cascade", cascade.to_string())],
            Action::SubmitShard { step, index, shard_id, .. } => vec![
                ("step", step.clone()),
                ("index", index.to_string()),
                ("shard_id", shard_id.to_string()),
            ],
            Action::CancelShards { step } => vec![("step", step.clone())],
        }
    }

    /// Convenience for the common no-meta append.
    pub fn append(event: Event) -> Self {
        Action::Append { event, meta: Map::new() }
    }
}
