// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Distributed KV contract with optimistic concurrency.
//!
//! Loop and fan-in state is mirrored here so any engine replica can read
//! it; writes are revision-checked compare-and-swap with bounded retries.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Bounded retries for optimistic writes.
pub const KV_RETRY_LIMIT: u32 = 5;
/// Base backoff between optimistic retries (exponential).
pub const KV_RETRY_BASE_MS: u64 = 10;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("revision conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("kv retries exhausted for {key}")]
    RetriesExhausted { key: String },
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store with revision-checked writes.
///
/// Revisions start at 1 on first write; `expected = 0` asserts the key is
/// absent. `put` with `expected = None` is unconditional.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<(Value, u64)>, KvError>;
    async fn put(&self, key: &str, value: Value, expected: Option<u64>) -> Result<u64, KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// In-process [`KvStore`]. The trait is the seam for a real distributed
/// backend; the engine only ever talks through it.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (Value, u64)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<(Value, u64)>, KvError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value, expected: Option<u64>) -> Result<u64, KvError> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if let Some(expected) = expected {
            if expected != current {
                return Err(KvError::Conflict {
                    key: key.to_string(),
                    expected,
                    found: current,
                });
            }
        }
        let next = current + 1;
        entries.insert(key.to_string(), (value, next));
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Atomic append-by-index into a JSON array stored under `key`.
///
/// Reads the current array, places `value` at `index` (growing with nulls
/// as needed), and writes back with a revision check. On conflict, retries
/// up to [`KV_RETRY_LIMIT`] times with exponential backoff from
/// [`KV_RETRY_BASE_MS`]. Placement is by index, never by completion order.
pub async fn kv_append_by_index(
    kv: &dyn KvStore,
    key: &str,
    index: usize,
    value: Value,
) -> Result<u64, KvError> {
    for round in 0..KV_RETRY_LIMIT {
        let (mut array, revision) = match kv.get(key).await? {
            Some((Value::Array(items), rev)) => (items, rev),
            Some((_, rev)) => (Vec::new(), rev),
            None => (Vec::new(), 0),
        };

        if array.len() <= index {
            array.resize(index + 1, Value::Null);
        }
        array[index] = value.clone();

        match kv.put(key, Value::Array(array), Some(revision)).await {
            Ok(rev) => return Ok(rev),
            Err(KvError::Conflict { .. }) => {
                let delay = KV_RETRY_BASE_MS << round;
                tracing::debug!(key, round, delay_ms = delay, "kv append conflict, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(KvError::RetriesExhausted { key: key.to_string() })
}

#[cfg(test)]
#[path = "kv_tests.rs"]
mod tests;
