// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine error taxonomy.

use noetl_core::ExecutionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),
    #[error("step not found in playbook: {0}")]
    StepNotFound(String),
    #[error("invalid playbook: {0}")]
    PlaybookInvalid(String),
    #[error("template error in step {step}: {source}")]
    Template {
        step: String,
        #[source]
        source: noetl_playbook::TemplateError,
    },
    #[error("event log error: {0}")]
    Log(#[from] noetl_storage::LogError),
    #[error("kv error: {0}")]
    Kv(#[from] noetl_storage::KvError),
    #[error("result store error: {0}")]
    Store(#[from] noetl_storage::StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] noetl_queue::QueueError),
}

impl EngineError {
    /// Transient errors are retried with bounded backoff before the
    /// execution is failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Log(noetl_storage::LogError::Io(_))
                | EngineError::Kv(noetl_storage::KvError::Unavailable(_))
                | EngineError::Kv(noetl_storage::KvError::RetriesExhausted { .. })
        )
    }
}
