// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ID types and generation.
//!
//! String IDs (queue items, workers, loops, shards) are fixed-capacity
//! inline buffers with 4-character type prefixes. Execution IDs are 64-bit
//! monotonically unique integers minted by [`ExecutionIdGen`]; event IDs
//! are per-execution monotonic sequence numbers assigned by the log.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Maximum byte length for an inline string ID.
///
/// Generated IDs are exactly 22 bytes (4-char prefix + 18-char nanoid);
/// `IdBuf::new` accepts shorter IDs but debug-asserts they fit.
pub const ID_MAX_LEN: usize = 22;

/// Returns a string slice truncated to at most `n` characters.
pub fn short(s: &str, n: usize) -> &str {
    if s.len() <= n {
        s
    } else {
        &s[..n]
    }
}

/// Fixed-size inline ID buffer. Always ≤ 22 ASCII bytes, `Copy`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdBuf {
    len: u8,
    buf: [u8; ID_MAX_LEN],
}

impl IdBuf {
    pub const fn empty() -> Self {
        Self { len: 0, buf: [0; ID_MAX_LEN] }
    }

    pub fn new(s: &str) -> Self {
        debug_assert!(
            s.len() <= ID_MAX_LEN,
            "ID exceeds {} bytes ({} bytes): {:?}",
            ID_MAX_LEN,
            s.len(),
            s,
        );
        let len = s.len().min(ID_MAX_LEN);
        let mut buf = [0u8; ID_MAX_LEN];
        buf[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self { len: len as u8, buf }
    }

    pub fn as_str(&self) -> &str {
        // Invariant: only constructed from &str, always valid UTF-8.
        match std::str::from_utf8(&self.buf[..self.len as usize]) {
            Ok(s) => s,
            Err(_) => unreachable!("IdBuf constructed from non-UTF-8"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::hash::Hash for IdBuf {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Hash only the active bytes so it matches str::hash,
        // which is required for Borrow<str> HashMap lookups.
        self.as_str().hash(state);
    }
}

impl std::borrow::Borrow<str> for IdBuf {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Debug for IdBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl std::fmt::Display for IdBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for IdBuf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IdBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.len() > ID_MAX_LEN {
            return Err(serde::de::Error::custom(format!(
                "ID exceeds {} bytes: {:?}",
                ID_MAX_LEN, s
            )));
        }
        Ok(IdBuf::new(&s))
    }
}

crate::define_id! {
    /// Unique identifier for a queued command.
    pub struct QueueId("cmd-");
}

crate::define_id! {
    /// Unique identifier for a worker instance.
    pub struct WorkerId("wkr-");
}

crate::define_id! {
    /// Unique identifier for one fan-out loop run.
    pub struct LoopId("loop");
}

crate::define_id! {
    /// Unique identifier for a fan-out shard.
    pub struct ShardId("shd-");
}

/// Unique identifier for an execution.
///
/// 64-bit, monotonically unique across the process: high bits carry the
/// epoch-millisecond timestamp, low bits a per-millisecond sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ExecutionId(pub i64);

impl ExecutionId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-execution monotonic event sequence number, assigned by the log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    pub const ZERO: EventId = EventId(0);

    pub fn next(&self) -> EventId {
        EventId(self.0 + 1)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snowflake-style generator for [`ExecutionId`].
///
/// Packs `epoch_ms << 20 | sequence`. The sequence resets each millisecond
/// and the generator never hands out the same ID twice, even when the clock
/// reads the same millisecond or runs backwards.
#[derive(Debug)]
pub struct ExecutionIdGen {
    state: Mutex<GenState>,
}

#[derive(Debug, Default)]
struct GenState {
    last_ms: u64,
    seq: u64,
}

const SEQ_BITS: u64 = 20;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

impl ExecutionIdGen {
    pub fn new() -> Self {
        Self { state: Mutex::new(GenState::default()) }
    }

    /// Mint the next unique execution ID for the given clock reading.
    pub fn next(&self, epoch_ms: u64) -> ExecutionId {
        let mut state = self.state.lock();
        let ms = epoch_ms.max(state.last_ms);
        if ms == state.last_ms {
            state.seq = (state.seq + 1) & SEQ_MASK;
            // Sequence exhausted within one millisecond: borrow from the future.
            if state.seq == 0 {
                state.last_ms += 1;
            }
        } else {
            state.last_ms = ms;
            state.seq = 0;
        }
        ExecutionId(((state.last_ms << SEQ_BITS) | state.seq) as i64)
    }
}

impl Default for ExecutionIdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
