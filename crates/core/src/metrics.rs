// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide counters shared between engine, queue, and workers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

pub const EVENTS_APPENDED_TOTAL: &str = "noetl_events_appended_total";
pub const COMMANDS_IN_FLIGHT: &str = "noetl_commands_in_flight";
pub const QUEUE_LEASE_LATENCY_SECONDS: &str = "noetl_queue_lease_latency_seconds";
pub const STEP_RETRIES_TOTAL: &str = "noetl_step_retries_total";
pub const ITERATOR_ITERATIONS_TOTAL: &str = "noetl_iterator_iterations_total";
pub const EXECUTION_DURATION_SECONDS: &str = "noetl_execution_duration_seconds";

/// Shared metric registry. Cheap to clone; all handles update one set
/// of atomics. Exported via [`Metrics::snapshot`] for scraping.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    events_appended: AtomicU64,
    commands_in_flight: AtomicI64,
    lease_latency_ms_sum: AtomicU64,
    lease_count: AtomicU64,
    step_retries: AtomicU64,
    iterator_iterations: AtomicU64,
    execution_duration_ms_sum: AtomicU64,
    executions_finished: AtomicU64,
}

/// Point-in-time metric values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_appended_total: u64,
    pub commands_in_flight: i64,
    pub queue_lease_latency_seconds_avg: f64,
    pub step_retries_total: u64,
    pub iterator_iterations_total: u64,
    pub execution_duration_seconds_avg: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_appended(&self) {
        self.inner.events_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_enqueued(&self) {
        self.inner.commands_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_settled(&self) {
        self.inner.commands_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn lease_observed(&self, wait_ms: u64) {
        self.inner.lease_latency_ms_sum.fetch_add(wait_ms, Ordering::Relaxed);
        self.inner.lease_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_retried(&self) {
        self.inner.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn iteration_run(&self) {
        self.inner.iterator_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_finished(&self, duration_ms: u64) {
        self.inner.execution_duration_ms_sum.fetch_add(duration_ms, Ordering::Relaxed);
        self.inner.executions_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let lease_count = self.inner.lease_count.load(Ordering::Relaxed);
        let finished = self.inner.executions_finished.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_appended_total: self.inner.events_appended.load(Ordering::Relaxed),
            commands_in_flight: self.inner.commands_in_flight.load(Ordering::Relaxed),
            queue_lease_latency_seconds_avg: if lease_count == 0 {
                0.0
            } else {
                self.inner.lease_latency_ms_sum.load(Ordering::Relaxed) as f64
                    / lease_count as f64
                    / 1_000.0
            },
            step_retries_total: self.inner.step_retries.load(Ordering::Relaxed),
            iterator_iterations_total: self.inner.iterator_iterations.load(Ordering::Relaxed),
            execution_duration_seconds_avg: if finished == 0 {
                0.0
            } else {
                self.inner.execution_duration_ms_sum.load(Ordering::Relaxed) as f64
                    / finished as f64
                    / 1_000.0
            },
        }
    }
}
