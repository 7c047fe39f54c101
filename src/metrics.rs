//! Process counters.
//!
//! Each counter set is an ordinary value built by the binary at startup and
//! handed to the components that update it (wrapped in an `Arc`). Nothing
//! here is global. Snapshots serialize for `GET /metrics` and the worker's
//! periodic statistics line.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for the message producer.
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    published: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherSnapshot {
    pub published: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl PublisherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Event failed validation before reaching the broker.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot {
            published: self.published.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one consumer pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    received: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    dead_lettered: AtomicU64,
    settle_failures: AtomicU64,
    delivery_millis: AtomicU64,
    deliveries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub settle_failures: u64,
    /// Mean sink latency over all deliveries, in milliseconds
    pub mean_delivery_ms: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// The broker refused a disposition; the lock will expire instead.
    pub fn record_settle_failure(&self) {
        self.settle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, elapsed: Duration) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        self.delivery_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let deliveries = self.deliveries.load(Ordering::Relaxed);
        let mean_delivery_ms = self
            .delivery_millis
            .load(Ordering::Relaxed)
            .checked_div(deliveries)
            .unwrap_or(0);
        PipelineSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            mean_delivery_ms,
        }
    }
}
