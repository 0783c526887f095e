// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Playbook document model.
//!
//! Parsing and schema validation happen upstream; this crate receives the
//! validated document as serde data and gives the engine a typed view.

use noetl_core::{LoopMode, PagePolicy, ResultScope, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Playbook identity within the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
}

/// A validated workflow document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Playbook {
    #[serde(default)]
    pub metadata: Metadata,
    /// Free-form configuration; becomes the initial `workload` context
    #[serde(default)]
    pub workload: Map<String, Value>,
    /// Named task templates referenced from steps via `task:`
    #[serde(default)]
    pub workbook: BTreeMap<String, ToolDef>,
    #[serde(default)]
    pub workflow: Vec<Step>,
}

impl Playbook {
    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// The entry step: the one named `start`, or the first in the workflow.
    pub fn start(&self) -> Option<&Step> {
        self.step("start").or_else(|| self.workflow.first())
    }

    /// Resolve a step's tool, merging a `task:` workbook reference with the
    /// step's own params (step params win).
    pub fn resolve_tool(&self, step: &Step) -> Option<ToolDef> {
        match (&step.tool, &step.task) {
            (Some(tool), None) => Some(tool.clone()),
            (None, Some(task)) => self.workbook.get(task).cloned(),
            (Some(tool), Some(task)) => {
                let mut merged = self.workbook.get(task).cloned()?;
                if !tool.kind.is_empty() {
                    merged.kind = tool.kind.clone();
                }
                for (k, v) in &tool.params {
                    merged.params.insert(k.clone(), v.clone());
                }
                Some(merged)
            }
            (None, None) => None,
        }
    }
}

/// A tool invocation: executor kind plus its rendered-at-dispatch params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(default)]
    pub kind: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Loop declaration on a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDef {
    /// The collection: a JSON array, or a template expression yielding one
    #[serde(rename = "in")]
    pub collection: Value,
    pub iterator: String,
    #[serde(default)]
    pub mode: LoopMode,
    /// Elements per command in `chunked` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
}

/// Fan-out policy for `mode: fanout` loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutDef {
    /// Proceed with a partial result set instead of failing fast
    #[serde(default)]
    pub allow_partial: bool,
    /// Collection elements per shard
    #[serde(default = "default_shard_size")]
    pub shard_size: usize,
}

fn default_shard_size() -> usize {
    1
}

impl Default for FanoutDef {
    fn default() -> Self {
        Self { allow_partial: false, shard_size: default_shard_size() }
    }
}

/// One routing rule in `next:` or `case:`.
///
/// `then`/`step` both name the target (aliases); a rule without `when`
/// is the `else` arm. `do: fail` fails the execution instead of routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, rename = "do", skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Extra variables injected into the target step's context
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl NextRule {
    pub fn target(&self) -> Option<&str> {
        self.then.as_deref().or(self.step.as_deref())
    }

    pub fn is_fail(&self) -> bool {
        self.action.as_deref() == Some("fail")
    }

    pub fn is_else(&self) -> bool {
        self.when.is_none()
    }
}

/// What the `else` arm of a `case` resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum ElseAction {
    Fail,
    Route(String),
}

/// Result storage backend selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSpec {
    #[serde(default = "default_store_kind")]
    pub kind: String,
}

fn default_store_kind() -> String {
    "auto".to_string()
}

impl Default for StoreSpec {
    fn default() -> Self {
        Self { kind: default_store_kind() }
    }
}

/// Step output handling: selection, externalization, and lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    #[serde(default)]
    pub store: StoreSpec,
    /// Extracted fields: name → dotted path into the tool result
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub select: BTreeMap<String, String>,
    #[serde(default)]
    pub scope: ResultScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_max_bytes: Option<usize>,
}

/// One task inside a `pipe:` sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipeTask {
    /// Task name, exposed as `_task` in pipeline templates
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolDef>,
    /// Workbook task reference (alternative to an inline tool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

/// Centralized pipeline error handling.
///
/// When a task fails and `cond` (rendered with `_err`/`_task`/`_attempt`)
/// is truthy, the pipeline completes with `result`; otherwise it fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Named node in the workflow graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    /// Unique step name
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolDef>,
    /// Workbook task reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_def: Option<LoopDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout: Option<FanoutDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PagePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Variable extractions applied after `call.done`: name → template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<NextRule>,
    /// Error/result routing arms evaluated when `next` doesn't apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub case: Vec<NextRule>,
    /// Keychain credential reference resolved worker-side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDef>,
    /// Atomic in-worker task sequence
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipe: Vec<PipeTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<CatchDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finally: Option<PipeTask>,
    /// Worker pool this step's commands route to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

impl Step {
    pub fn has_loop(&self) -> bool {
        self.loop_def.is_some()
    }

    pub fn has_pipeline(&self) -> bool {
        !self.pipe.is_empty()
    }

    /// A step with no tool, task, loop, or pipe is routing-only.
    pub fn is_routing_only(&self) -> bool {
        self.tool.is_none() && self.task.is_none() && !self.has_loop() && !self.has_pipeline()
    }

    /// Terminal when it declares no outgoing transitions at all.
    pub fn is_terminal(&self) -> bool {
        self.next.is_empty() && self.case.is_empty()
    }

    /// First matching `case` arm's action for the else branch.
    pub fn case_else(&self) -> Option<ElseAction> {
        let arm = self.case.iter().find(|r| r.is_else())?;
        if arm.is_fail() {
            Some(ElseAction::Fail)
        } else {
            arm.target().map(|t| ElseAction::Route(t.to_string()))
        }
    }
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
