// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! noetl-storage: Event log, state projection, KV mirror, and result store

mod kv;
mod log;
mod state;
mod store;

pub use kv::{kv_append_by_index, KvError, KvStore, MemoryKv, KV_RETRY_BASE_MS, KV_RETRY_LIMIT};
pub use log::{loop_kv_key, DurableLog, LogError};
pub use state::{ExecutionState, Failure};
pub use store::{
    FsObjectBackend, KvBackend, MemoryBackend, ResultBackend, StoreConfig, StoreError, TieredStore,
};
