//! Ingestion counters.
//!
//! Lock-free atomics shared between the runner and whoever reports on it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct IngestStats {
    records_received: AtomicU64,
    records_rejected: AtomicU64,
    stages_run: AtomicU64,
    stage_failures: AtomicU64,
    event_buckets_written: AtomicU64,
    node_updates_skipped: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub records_received: u64,
    /// Records whose payload could not be parsed at all.
    pub records_rejected: u64,
    /// Stage transactions opened; stages that do not apply to a kind are skipped.
    pub stages_run: u64,
    pub stage_failures: u64,
    pub event_buckets_written: u64,
    pub node_updates_skipped: u64,
}

impl IngestStats {
    pub(crate) fn record_received(&self) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.records_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stage_run(&self) {
        self.stages_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stage_failed(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn buckets_written(&self, count: usize) {
        self.event_buckets_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn node_update_skipped(&self) {
        self.node_updates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            records_received: self.records_received.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            stages_run: self.stages_run.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            event_buckets_written: self.event_buckets_written.load(Ordering::Relaxed),
            node_updates_skipped: self.node_updates_skipped.load(Ordering::Relaxed),
        }
    }
}
