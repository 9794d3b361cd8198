//! Retention manager — background task that keeps the store within its
//! time and size budgets.
//!
//! Each cycle looks at the oldest partition across all tables. When it is
//! older than `max_lookback`, or the store holds more than
//! `max_disk_bytes`, that one partition is removed from every table and the
//! next cycle starts right away. Otherwise the task sleeps for `interval`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kubetrail_store::{StoreResult, TableKind, Tables};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RetentionFailure, RetentionResult};

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Oldest data to keep.
    pub max_lookback: Duration,
    /// Store size budget in bytes; zero disables the size trigger.
    pub max_disk_bytes: u64,
    /// Sleep between cycles that drop nothing.
    pub interval: Duration,
}

/// Why a partition was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Age,
    Size,
}

/// Result of one retention cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// No partitions at all.
    Empty,
    WithinBudget,
    Dropped {
        partition: String,
        trigger: Trigger,
        keys_removed: u64,
        failures: Vec<RetentionFailure>,
    },
}

#[derive(Debug, Default)]
pub struct RetentionStats {
    cycles: AtomicU64,
    partitions_dropped: AtomicU64,
    keys_removed: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionSnapshot {
    pub cycles: u64,
    pub partitions_dropped: u64,
    pub keys_removed: u64,
    pub failures: u64,
}

impl RetentionStats {
    pub fn snapshot(&self) -> RetentionSnapshot {
        RetentionSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            partitions_dropped: self.partitions_dropped.load(Ordering::Relaxed),
            keys_removed: self.keys_removed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Removes one table's share of a partition.
pub trait PartitionDropper: Send + Sync {
    /// Returns the number of rows removed.
    fn drop_partition(&self, table: TableKind, partition_id: &str) -> StoreResult<u64>;
}

impl PartitionDropper for Tables {
    fn drop_partition(&self, table: TableKind, partition_id: &str) -> StoreResult<u64> {
        Tables::drop_partition(self, table, partition_id)
    }
}

pub struct RetentionManager {
    tables: Tables,
    dropper: Box<dyn PartitionDropper>,
    config: RetentionConfig,
    stats: Arc<RetentionStats>,
}

impl RetentionManager {
    pub fn new(tables: Tables, config: RetentionConfig) -> Self {
        let dropper = Box::new(tables.clone());
        Self::with_dropper(tables, dropper, config)
    }

    /// Like [`new`](Self::new), but partitions are removed through `dropper`.
    /// Bounds and footprint are still read from `tables`.
    pub fn with_dropper(
        tables: Tables,
        dropper: Box<dyn PartitionDropper>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            tables,
            dropper,
            config,
            stats: Arc::new(RetentionStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RetentionStats> {
        Arc::clone(&self.stats)
    }

    /// Decide whether the oldest partition has to go.
    ///
    /// Nothing fires while `min == max`: the only partition is the one
    /// being written to.
    pub fn evaluate(&self, now: DateTime<Utc>, min: &str, max: &str) -> RetentionResult<Option<Trigger>> {
        if min == max {
            return Ok(None);
        }

        let oldest_start = self.tables.clock().partition_start(min)?;
        let age = (now - oldest_start).to_std().unwrap_or_default();
        if age > self.config.max_lookback {
            debug!(partition = %min, age_secs = age.as_secs(), "oldest partition past lookback");
            return Ok(Some(Trigger::Age));
        }

        if self.config.max_disk_bytes > 0 {
            let footprint = self.tables.store().footprint_bytes()?;
            if footprint > self.config.max_disk_bytes {
                debug!(footprint, budget = self.config.max_disk_bytes, "store over size budget");
                return Ok(Some(Trigger::Size));
            }
        }

        Ok(None)
    }

    /// Run one retention cycle at `now`, dropping at most one partition.
    pub fn check(&self, now: DateTime<Utc>) -> RetentionResult<CycleOutcome> {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let Some((min, max)) = self.tables.min_max_partition()? else {
            return Ok(CycleOutcome::Empty);
        };
        let Some(trigger) = self.evaluate(now, &min, &max)? else {
            return Ok(CycleOutcome::WithinBudget);
        };

        let mut keys_removed = 0;
        let mut failures = Vec::new();
        for table in TableKind::ALL {
            match self.dropper.drop_partition(table, &min) {
                Ok(removed) => keys_removed += removed,
                Err(source) => {
                    warn!(%table, partition = %min, error = %source, "partition drop failed");
                    failures.push(RetentionFailure {
                        table,
                        partition: min.clone(),
                        source,
                    });
                }
            }
        }

        self.stats.keys_removed.fetch_add(keys_removed, Ordering::Relaxed);
        self.stats
            .failures
            .fetch_add(failures.len() as u64, Ordering::Relaxed);
        if failures.is_empty() {
            self.stats.partitions_dropped.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            partition = %min,
            ?trigger,
            keys_removed,
            failed_tables = failures.len(),
            "dropped oldest partition"
        );
        Ok(CycleOutcome::Dropped {
            partition: min,
            trigger,
            keys_removed,
            failures,
        })
    }

    /// Loop until `shutdown` fires. After a clean drop the next cycle runs
    /// immediately; otherwise the loop sleeps for the configured interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_lookback_secs = self.config.max_lookback.as_secs(),
            max_disk_bytes = self.config.max_disk_bytes,
            interval_secs = self.config.interval.as_secs(),
            "retention started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let catch_up = match self.check(Utc::now()) {
                Ok(CycleOutcome::Dropped { failures, .. }) => failures.is_empty(),
                Ok(CycleOutcome::Empty) => {
                    debug!("store is empty");
                    false
                }
                Ok(CycleOutcome::WithinBudget) => false,
                Err(e) => {
                    error!(error = %e, "retention cycle failed");
                    false
                }
            };
            if catch_up {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("retention stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
