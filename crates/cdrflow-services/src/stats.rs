//! Pipeline counters
//!
//! Observability only; nothing in the pipeline reads them to make decisions.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every consumer of the process
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    persisted: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
    publish_failures: AtomicU64,
    released: AtomicU64,
}

/// Point-in-time copy of the counters, as served by the stats endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub discarded: u64,
    pub publish_failures: u64,
    pub released: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    /// Requeued onto the retry queue
    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Moved to the rejected queue
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Dropped without retry (unknown routing key)
    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Handed back to the transport unhandled
    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}
