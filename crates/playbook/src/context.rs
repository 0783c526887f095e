// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Render context assembly.
//!
//! Contexts are built per render call from the execution's projected state
//! plus event-local variables; nothing is cached across steps. Documented
//! variables: `workload`, `vars`, `<step_name>` (result views), `iterator.*`,
//! `response`, `_prev`, `_task`, `_err`, `_attempt`, `event`, `fanin`,
//! `keychain`.

use serde_json::{Map, Value};

/// Builder for the per-render variable map.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    root: Map<String, Value>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workload(mut self, workload: Map<String, Value>) -> Self {
        self.root.insert("workload".into(), Value::Object(workload));
        self
    }

    pub fn vars(mut self, vars: Map<String, Value>) -> Self {
        self.root.insert("vars".into(), Value::Object(vars));
        self
    }

    /// Expose each completed step's lightweight result view under the
    /// step's own name.
    pub fn step_results<'a>(mut self, results: impl Iterator<Item = (&'a str, Value)>) -> Self {
        for (name, view) in results {
            self.root.insert(name.to_string(), view);
        }
        self
    }

    /// Iterator scope: `iterator.<name>` is the element, `iterator._index`
    /// the zero-based position.
    pub fn iterator(mut self, name: &str, element: Value, index: usize) -> Self {
        let mut scope = Map::new();
        scope.insert(name.to_string(), element);
        scope.insert("_index".into(), Value::from(index));
        self.root.insert("iterator".into(), Value::Object(scope));
        self
    }

    /// `response` scope for retry / pagination expressions.
    pub fn response(mut self, response: Value) -> Self {
        self.root.insert("response".into(), response);
        self
    }

    /// Pipeline-local scope.
    pub fn pipeline(mut self, prev: Value, task: &str, attempt: u32) -> Self {
        self.root.insert("_prev".into(), prev);
        self.root.insert("_task".into(), Value::String(task.to_string()));
        self.root.insert("_attempt".into(), Value::from(attempt));
        self
    }

    pub fn error(mut self, err: Value) -> Self {
        self.root.insert("_err".into(), err);
        self
    }

    /// The event that triggered the current decision.
    pub fn event(mut self, event: Value) -> Self {
        self.root.insert("event".into(), event);
        self
    }

    /// Fan-in summary for routing after a fan-out loop.
    pub fn fanin(mut self, fanin: Value) -> Self {
        self.root.insert("fanin".into(), fanin);
        self
    }

    /// Resolved keychain credentials, exposed as `keychain.<name>.*`.
    pub fn keychain(mut self, keychain: Map<String, Value>) -> Self {
        self.root.insert("keychain".into(), Value::Object(keychain));
        self
    }

    /// Extra rule-level `data:` variables (highest precedence).
    pub fn data(mut self, data: &Map<String, Value>) -> Self {
        for (k, v) in data {
            self.root.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.root)
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
