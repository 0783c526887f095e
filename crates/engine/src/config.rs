// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration.

/// Tunables for the orchestrator. Defaults are production values; tests
/// override through the setters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pool commands route to when the step names none
    pub default_pool: String,
    /// Concurrency window for `async` loops (engine-side semaphore)
    pub async_concurrency: usize,
    /// Elements per command for `chunked` loops without an explicit size
    pub default_chunk_size: usize,
    /// Bounded retries for transient log appends
    pub append_retry_limit: u32,
    pub append_retry_base_ms: u64,
    /// Bounded retries for transient decision errors
    pub decision_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_pool: "default".into(),
            async_concurrency: 8,
            default_chunk_size: 10,
            append_retry_limit: 3,
            append_retry_base_ms: 10,
            decision_retry_limit: 2,
        }
    }
}

impl EngineConfig {
    pub fn default_pool(mut self, pool: impl Into<String>) -> Self {
        self.default_pool = pool.into();
        self
    }

    pub fn async_concurrency(mut self, cap: usize) -> Self {
        self.async_concurrency = cap;
        self
    }

    pub fn default_chunk_size(mut self, size: usize) -> Self {
        self.default_chunk_size = size;
        self
    }
}
