// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command queue with at-most-one concurrent execution per dedupe key.
//!
//! Commands become visible at `available_at`, are leased with a visibility
//! timeout, and are deleted on ack. An expired lease makes the command
//! re-leasable, so delivery is at-least-once: consumers must tolerate
//! duplicates (dedupe happens at event ingest).

use noetl_core::{Clock, Command, DedupeKey, ExecutionId, Metrics, QueueId, WorkerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown command: {0}")]
    UnknownCommand(QueueId),
    #[error("command {0} is not leased")]
    NotLeased(QueueId),
    #[error("command {queue_id} is leased by {holder}, not {caller}")]
    WrongWorker {
        queue_id: QueueId,
        holder: WorkerId,
        caller: WorkerId,
    },
}

/// Current lease holder and deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub worker_id: WorkerId,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum ItemState {
    Ready,
    Leased(LeaseInfo),
    /// Leased at cancellation time; kept so the holder's ack drains it,
    /// never re-leased.
    Cancelled,
}

struct Item {
    cmd: Command,
    state: ItemState,
    /// FIFO tiebreak within a pool
    seq: u64,
    enqueued_at_ms: u64,
}

#[derive(Default)]
struct QueueInner {
    items: HashMap<QueueId, Item>,
    by_dedupe: HashMap<DedupeKey, QueueId>,
    next_seq: u64,
}

/// In-process queue with durable-queue semantics behind a narrow surface.
pub struct CommandQueue<C: Clock> {
    clock: C,
    metrics: Metrics,
    inner: Mutex<QueueInner>,
}

impl<C: Clock> CommandQueue<C> {
    pub fn new(clock: C, metrics: Metrics) -> Self {
        Self { clock, metrics, inner: Mutex::new(QueueInner::default()) }
    }

    /// Enqueue a command. Idempotent on the dedupe key
    /// `(execution_id, step, attempt, shard)`: a second enqueue returns
    /// the existing queue id.
    pub fn enqueue(&self, cmd: Command) -> QueueId {
        let mut inner = self.inner.lock();
        let key = cmd.dedupe_key();
        if let Some(existing) = inner.by_dedupe.get(&key) {
            tracing::debug!(queue_id = %existing, step = %cmd.step, "duplicate enqueue collapsed");
            return *existing;
        }

        let queue_id = cmd.queue_id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_dedupe.insert(key, queue_id);
        inner.items.insert(
            queue_id,
            Item { cmd, state: ItemState::Ready, seq, enqueued_at_ms: self.clock.epoch_ms() },
        );
        self.metrics.command_enqueued();
        queue_id
    }

    /// Lease the next available command for `pool`.
    ///
    /// Only commands with `available_at ≤ now` are visible. Within one
    /// `(execution, step)`, attempts dispatch in attempt order; across
    /// groups the queue is FIFO. Returns `None` when nothing is ready.
    pub fn lease(&self, pool: &str, worker_id: &WorkerId, lease_secs: u64) -> Option<Command> {
        let now = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        reclaim_expired(&mut inner, now);

        // Lowest attempt per (execution, step) group, whether or not that
        // attempt is currently visible.
        let mut min_attempt: HashMap<(ExecutionId, &str), u32> = HashMap::new();
        for item in inner.items.values() {
            if item.cmd.target_pool != pool {
                continue;
            }
            let key = (item.cmd.execution_id, item.cmd.step.as_str());
            let entry = min_attempt.entry(key).or_insert(u32::MAX);
            *entry = (*entry).min(item.cmd.attempt);
        }

        let picked = inner
            .items
            .values()
            .filter(|item| {
                item.state == ItemState::Ready
                    && item.cmd.target_pool == pool
                    && item.cmd.available_at_ms <= now
                    && min_attempt
                        .get(&(item.cmd.execution_id, item.cmd.step.as_str()))
                        .is_none_or(|min| item.cmd.attempt <= *min)
            })
            .min_by_key(|item| item.seq)
            .map(|item| item.cmd.queue_id)?;

        let deadline_ms = now + lease_secs * 1_000;
        let item = inner.items.get_mut(&picked)?;
        item.state = ItemState::Leased(LeaseInfo { worker_id: worker_id.clone(), deadline_ms });

        let visible_since = item.enqueued_at_ms.max(item.cmd.available_at_ms);
        self.metrics.lease_observed(now.saturating_sub(visible_since));
        tracing::debug!(
            queue_id = %picked,
            step = %item.cmd.step,
            attempt = item.cmd.attempt,
            worker = %worker_id,
            "leased"
        );
        Some(item.cmd.clone())
    }

    /// Refresh a lease held by `worker_id` (heartbeat).
    pub fn extend_lease(
        &self,
        queue_id: QueueId,
        worker_id: &WorkerId,
        lease_secs: u64,
    ) -> Result<(), QueueError> {
        let now = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        let item = inner.items.get_mut(&queue_id).ok_or(QueueError::UnknownCommand(queue_id))?;
        match &mut item.state {
            ItemState::Leased(lease) if &lease.worker_id == worker_id => {
                lease.deadline_ms = now + lease_secs * 1_000;
                Ok(())
            }
            ItemState::Leased(lease) => Err(QueueError::WrongWorker {
                queue_id,
                holder: lease.worker_id.clone(),
                caller: worker_id.clone(),
            }),
            _ => Err(QueueError::NotLeased(queue_id)),
        }
    }

    /// Delete a settled command. Acking an already-removed command is a
    /// no-op (late acks after cancellation or expiry are expected).
    pub fn ack(&self, queue_id: QueueId) {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.items.remove(&queue_id) {
            let key = item.cmd.dedupe_key();
            if inner.by_dedupe.get(&key) == Some(&queue_id) {
                inner.by_dedupe.remove(&key);
            }
            self.metrics.command_settled();
        }
    }

    /// Release a lease and reschedule after `delay_ms`.
    pub fn nack(&self, queue_id: QueueId, delay_ms: u64) -> Result<(), QueueError> {
        let now = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        let item = inner.items.get_mut(&queue_id).ok_or(QueueError::UnknownCommand(queue_id))?;
        if !matches!(item.state, ItemState::Leased(_)) {
            return Err(QueueError::NotLeased(queue_id));
        }
        item.state = ItemState::Ready;
        item.cmd.available_at_ms = now + delay_ms;
        Ok(())
    }

    /// Drop or cancel every command for an execution.
    ///
    /// Queued commands are removed and returned (the engine emits
    /// `command.cancelled` for them); leased commands are marked so they
    /// can never be re-leased and their late ack just drains them.
    pub fn cancel_for(&self, execution_id: ExecutionId) -> Vec<Command> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        let ids: Vec<QueueId> = inner
            .items
            .iter()
            .filter(|(_, item)| item.cmd.execution_id == execution_id)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let state = inner.items.get(&id).map(|i| i.state.clone());
            match state {
                Some(ItemState::Ready) => {
                    if let Some(item) = inner.items.remove(&id) {
                        let key = item.cmd.dedupe_key();
                        if inner.by_dedupe.get(&key) == Some(&id) {
                            inner.by_dedupe.remove(&key);
                        }
                        self.metrics.command_settled();
                        removed.push(item.cmd);
                    }
                }
                Some(ItemState::Leased(_)) => {
                    if let Some(item) = inner.items.get_mut(&id) {
                        item.state = ItemState::Cancelled;
                    }
                }
                _ => {}
            }
        }
        removed
    }

    /// Commands currently queued or leased.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Lease state for a command, if it exists.
    pub fn lease_info(&self, queue_id: QueueId) -> Option<LeaseInfo> {
        match &self.inner.lock().items.get(&queue_id)?.state {
            ItemState::Leased(info) => Some(info.clone()),
            _ => None,
        }
    }
}

/// Expired leases imply a crashed worker: the command becomes re-leasable.
fn reclaim_expired(inner: &mut QueueInner, now_ms: u64) {
    for item in inner.items.values_mut() {
        if let ItemState::Leased(lease) = &item.state {
            if lease.deadline_ms <= now_ms {
                tracing::warn!(
                    queue_id = %item.cmd.queue_id,
                    step = %item.cmd.step,
                    worker = %lease.worker_id,
                    "lease expired, reclaiming"
                );
                item.state = ItemState::Ready;
            }
        }
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
