// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lightweight result views.
//!
//! Large tool outputs are externalized to a tiered store; only a
//! [`ResultRef`] plus extracted scalar fields ever flow through the event
//! log or the render context.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Storage tier an externalized result lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreTier {
    /// Process-local memory
    Memory,
    /// Distributed KV (≤ 1 MiB)
    Kv,
    /// Object store (≤ 10 MiB)
    Object,
    /// Cloud blob storage, unbounded
    Cloud,
}

crate::simple_display! {
    StoreTier {
        Memory => "memory",
        Kv => "kv",
        Object => "object",
        Cloud => "cloud",
    }
}

/// Lifetime scope of a stored result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultScope {
    /// Collected when the producing step's successor completes
    #[default]
    Step,
    /// Collected when the execution reaches a terminal state
    Execution,
    /// Collected when the whole workflow tree (including children) drains
    Workflow,
    /// Never collected
    Permanent,
}

crate::simple_display! {
    ResultScope {
        Step => "step",
        Execution => "execution",
        Workflow => "workflow",
        Permanent => "permanent",
    }
}

/// Size thresholds for the `auto` tier rule.
pub const TIER_MEMORY_MAX: usize = 10 * 1024;
pub const TIER_KV_MAX: usize = 1024 * 1024;
pub const TIER_OBJECT_MAX: usize = 10 * 1024 * 1024;

impl StoreTier {
    /// Select a tier for a payload of `bytes` with the given scope.
    ///
    /// `size < 10 KiB ∧ scope=step → memory; < 1 MiB → kv;
    /// < 10 MiB → object; else cloud`.
    pub fn auto(bytes: usize, scope: ResultScope) -> StoreTier {
        if bytes < TIER_MEMORY_MAX && scope == ResultScope::Step {
            StoreTier::Memory
        } else if bytes < TIER_KV_MAX {
            StoreTier::Kv
        } else if bytes < TIER_OBJECT_MAX {
            StoreTier::Object
        } else {
            StoreTier::Cloud
        }
    }
}

/// Opaque pointer to an externally stored result.
///
/// Readers treat refs as immutable; the scope finalizer owns deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRef {
    /// Backend URI (e.g. `mem://…`, `kv://…`, `obj://…`)
    #[serde(rename = "ref")]
    pub uri: String,
    pub store: StoreTier,
    #[serde(default)]
    pub scope: ResultScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    pub bytes: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    /// Small fields selected out of the payload before externalization
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extracted: BTreeMap<String, Value>,
    /// Truncated sample of the payload for display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// The lightweight view of a step result that flows through events.
///
/// Exactly one of `inline` or `reference` is set: small payloads stay
/// inline, larger ones are externalized and carried by ref.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ResultRef>,
}

impl StepResult {
    pub fn inline(value: Value) -> Self {
        Self { inline: Some(value), reference: None }
    }

    pub fn external(reference: ResultRef) -> Self {
        Self { inline: None, reference: Some(reference) }
    }

    /// Fields visible to the render context: the inline value, or the
    /// extracted scalars of an externalized result.
    pub fn render_view(&self) -> Value {
        if let Some(inline) = &self.inline {
            return inline.clone();
        }
        if let Some(reference) = &self.reference {
            let mut map = serde_json::Map::new();
            for (k, v) in &reference.extracted {
                map.insert(k.clone(), v.clone());
            }
            map.insert("ref".into(), Value::String(reference.uri.clone()));
            return Value::Object(map);
        }
        Value::Null
    }

    pub fn is_external(&self) -> bool {
        self.reference.is_some()
    }
}

#[cfg(test)]
#[path = "result_ref_tests.rs"]
mod tests;
