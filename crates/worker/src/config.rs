// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker configuration.

use noetl_core::WorkerId;

/// Tunables for one worker instance.
///
/// Leases are kept shorter than `heartbeat_interval × safety factor` so a
/// crashed worker's commands become re-leasable promptly.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Pool this worker leases from
    pub pool: String,
    pub lease_secs: u64,
    pub heartbeat_interval_ms: u64,
    /// Results above this size are externalized (`output.store.kind=auto`)
    pub inline_max_bytes: usize,
    /// Truncation length for result previews
    pub preview_max_chars: usize,
    /// Idle poll interval when the queue is empty
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new(),
            pool: "default".into(),
            lease_secs: 30,
            heartbeat_interval_ms: 10_000,
            inline_max_bytes: 64 * 1024,
            preview_max_chars: 256,
            poll_interval_ms: 50,
        }
    }
}

impl WorkerConfig {
    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn lease_secs(mut self, secs: u64) -> Self {
        self.lease_secs = secs;
        self
    }

    pub fn inline_max_bytes(mut self, bytes: usize) -> Self {
        self.inline_max_bytes = bytes;
        self
    }
}
