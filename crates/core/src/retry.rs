// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry and pagination policies.
//!
//! A step carries at most one of each: an on-error [`RetryPolicy`] driving
//! re-attempts after `call.failed`, and an on-success [`PagePolicy`] driving
//! continuation after `call.done` (pagination).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// On-error retry policy for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
    /// Template expression; retry only while truthy. Empty means "kind says".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_when: Option<String>,
    /// Template expression; stop retrying once truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_when: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_multiplier(),
            jitter: false,
            retry_when: None,
            stop_when: None,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is permitted after `attempt` failed.
    ///
    /// `max_attempts = 1` disables retries entirely.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Base delay before the attempt following `attempt`:
    /// `min(initial * multiplier^(attempt-1), max)`.
    ///
    /// Jitter is applied by the caller via `jitter_factor` (uniform in
    /// [0.5, 1.5]); the policy itself stays deterministic.
    pub fn delay_ms_after(&self, attempt: u32, jitter_factor: f64) -> u64 {
        let exp = attempt.saturating_sub(1);
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let factor = if self.jitter { jitter_factor } else { 1.0 };
        (capped * factor).round() as u64
    }
}

/// How page results fold into the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Concatenate the selected arrays
    #[default]
    Append,
    /// Like append, but flatten one level of nesting first
    Extend,
    /// Keep only the latest page
    Replace,
    /// Keep every raw page as one element
    Collect,
}

crate::simple_display! {
    MergeStrategy {
        Append => "append",
        Extend => "extend",
        Replace => "replace",
        Collect => "collect",
    }
}

/// On-success continuation policy (pagination).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagePolicy {
    /// Template expression; fetch another page while truthy.
    pub continue_while: String,
    /// Payload mutations applied before the next attempt. Keys are dotted
    /// paths into the rendered payload (e.g. `params.page`), values are
    /// template expressions evaluated against the `response` context.
    #[serde(default)]
    pub next_page: BTreeMap<String, String>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    /// Dotted path selecting the page slice to merge (e.g. `data.data`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_path: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    100
}

impl PagePolicy {
    /// Whether another page may be fetched after `attempt` pages completed.
    pub fn allows_page(&self, attempt: u32) -> bool {
        attempt < self.max_iterations
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
