// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable append-only event log with per-execution total ordering.

use noetl_core::{EventId, EventRecord, ExecutionId, Metrics};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;

/// Default tolerance before an earlier-than-last timestamp is flagged.
pub const SKEW_TOLERANCE_MS: u64 = 5_000;

/// KV key under which a step's loop state is mirrored.
pub fn loop_kv_key(execution_id: ExecutionId, step: &str) -> String {
    format!("exec:{}:loop:{}", execution_id, step)
}

#[derive(Debug, Error)]
pub enum LogError {
    /// Second terminal event for one `(execution, step, attempt)`.
    /// The first recorded terminal wins; the duplicate is not appended.
    #[error("duplicate terminal event for {execution_id} step={step} attempt={attempt}")]
    Conflict {
        execution_id: ExecutionId,
        step: String,
        attempt: u32,
    },
    /// Timestamp predates the log head beyond the skew tolerance.
    /// The record IS appended (flagged in meta); callers may treat this
    /// as a warning.
    #[error("event {event_id} appended out of order")]
    OutOfOrder { event_id: EventId },
    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Default)]
struct ExecutionLog {
    records: Vec<EventRecord>,
    /// Attempts that already saw a terminal event
    terminals: HashSet<(String, u32)>,
    next_event_id: u64,
    last_timestamp_ms: u64,
}

struct LogInner {
    file: Option<BufWriter<File>>,
    executions: HashMap<ExecutionId, ExecutionLog>,
    subscribers: HashMap<ExecutionId, broadcast::Sender<EventRecord>>,
}

/// Append-only log of [`EventRecord`]s, durable before `append` returns.
///
/// Ordering within an execution is total (`event_id`); across executions
/// nothing is guaranteed. Reopening a file-backed log replays every line
/// and reconstructs identical indexes.
pub struct DurableLog {
    inner: Mutex<LogInner>,
    path: Option<PathBuf>,
    skew_tolerance_ms: u64,
    metrics: Metrics,
}

impl DurableLog {
    /// In-memory log (tests, embedded use).
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                file: None,
                executions: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            path: None,
            skew_tolerance_ms: SKEW_TOLERANCE_MS,
            metrics: Metrics::new(),
        }
    }

    /// Open (or create) a file-backed log, replaying existing records.
    pub fn open(path: impl AsRef<Path>, metrics: Metrics) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let mut executions: HashMap<ExecutionId, ExecutionLog> = HashMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: EventRecord = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        // Torn tail write from a crash: stop replay here.
                        tracing::warn!(line = lineno + 1, error = %e, "truncating log replay");
                        break;
                    }
                };
                let exec = executions.entry(record.execution_id).or_default();
                if let Some((step, attempt)) = record.event.terminal_key() {
                    exec.terminals.insert((step.to_string(), attempt));
                }
                exec.next_event_id = exec.next_event_id.max(record.event_id.0);
                exec.last_timestamp_ms = exec.last_timestamp_ms.max(record.timestamp_ms);
                exec.records.push(record);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Mutex::new(LogInner {
                file: Some(BufWriter::new(file)),
                executions,
                subscribers: HashMap::new(),
            }),
            path: Some(path),
            skew_tolerance_ms: SKEW_TOLERANCE_MS,
            metrics,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a record, assigning its per-execution `event_id`.
    ///
    /// Success is durable before return. A duplicate terminal for an
    /// attempt returns `Conflict` without appending. A timestamp earlier
    /// than the log head minus the skew tolerance is appended and flagged,
    /// and reported as `OutOfOrder` (carrying the assigned id).
    pub fn append(&self, mut record: EventRecord) -> Result<EventId, LogError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let exec = inner.executions.entry(record.execution_id).or_default();

        if let Some((step, attempt)) = record.event.terminal_key() {
            if !exec.terminals.insert((step.to_string(), attempt)) {
                return Err(LogError::Conflict {
                    execution_id: record.execution_id,
                    step: step.to_string(),
                    attempt,
                });
            }
        }

        // Event ids start at 1 so `EventId::ZERO` means "from the beginning".
        exec.next_event_id += 1;
        let event_id = EventId(exec.next_event_id);
        record.event_id = event_id;

        let out_of_order = record.timestamp_ms + self.skew_tolerance_ms < exec.last_timestamp_ms;
        if out_of_order {
            record.meta.insert("out_of_order".into(), Value::Bool(true));
        }
        exec.last_timestamp_ms = exec.last_timestamp_ms.max(record.timestamp_ms);

        if let Some(file) = inner.file.as_mut() {
            let line = serde_json::to_string(&record)?;
            writeln!(file, "{}", line)?;
            file.flush()?;
        }

        self.metrics.event_appended();
        tracing::debug!(
            execution_id = %record.execution_id,
            event_id = %event_id,
            "appended {}",
            record.event.log_summary()
        );

        if let Some(tx) = inner.subscribers.get(&record.execution_id) {
            let _ = tx.send(record.clone());
        }
        exec.records.push(record);

        if out_of_order {
            return Err(LogError::OutOfOrder { event_id });
        }
        Ok(event_id)
    }

    /// Records for an execution with `event_id` strictly after `after`.
    /// Monotonic and safe to re-read.
    pub fn events_since(&self, execution_id: ExecutionId, after: EventId) -> Vec<EventRecord> {
        let inner = self.inner.lock();
        inner
            .executions
            .get(&execution_id)
            .map(|exec| exec.records.iter().filter(|r| r.event_id > after).cloned().collect())
            .unwrap_or_default()
    }

    /// All records for an execution, in order.
    pub fn events(&self, execution_id: ExecutionId) -> Vec<EventRecord> {
        let inner = self.inner.lock();
        inner
            .executions
            .get(&execution_id)
            .map(|exec| exec.records.clone())
            .unwrap_or_default()
    }

    /// Live feed of newly appended records for one execution.
    pub fn subscribe(&self, execution_id: ExecutionId) -> broadcast::Receiver<EventRecord> {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    /// Project an execution's events into state. Pure and deterministic:
    /// equal prefixes yield equal states.
    pub fn project(&self, execution_id: ExecutionId) -> crate::ExecutionState {
        let records = self.events(execution_id);
        crate::ExecutionState::project(records.iter())
    }

    /// Executions present in the log.
    pub fn execution_ids(&self) -> Vec<ExecutionId> {
        let inner = self.inner.lock();
        inner.executions.keys().copied().collect()
    }
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
