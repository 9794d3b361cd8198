//! Store — redb-backed persistence for every kubetrail table.
//!
//! All tables share one redb table of `&str → &[u8]` rows keyed by the full
//! key string, so table and partition prefixes are plain byte-range
//! prefixes. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult, map_err};
use crate::keys::{AnyKey, PREFIX_END};
use crate::partition::{Granularity, PartitionClock};

/// The single physical table holding every logical table's rows.
pub(crate) const ROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("rows");

/// Rows as seen inside a write transaction.
pub type Rows<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

/// Rows as seen inside a read transaction.
pub type ReadRows = redb::ReadOnlyTable<&'static str, &'static [u8]>;

/// Anything rows can be read from: a read-only table or a write-transaction table.
pub trait RowSource: ReadableTable<&'static str, &'static [u8]> {}

impl<T: ReadableTable<&'static str, &'static [u8]>> RowSource for T {}

/// Key counts of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub total_keys: u64,
    pub keys_by_table: BTreeMap<String, u64>,
}

/// Thread-safe history store backed by redb.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    clock: PartitionClock,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path, granularity: Granularity) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            clock: PartitionClock::new(granularity),
            path: Some(path.to_path_buf()),
        };
        store.ensure_tables()?;
        debug!(?path, %granularity, "store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory(granularity: Granularity) -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            clock: PartitionClock::new(granularity),
            path: None,
        };
        store.ensure_tables()?;
        debug!(%granularity, "in-memory store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROWS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn clock(&self) -> PartitionClock {
        self.clock
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ── Transactions ───────────────────────────────────────────────

    /// Run `f` inside a read transaction.
    pub fn view<T, E>(&self, f: impl FnOnce(&ReadRows) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let rows = txn.open_table(ROWS).map_err(map_err!(Table))?;
        f(&rows)
    }

    /// Run `f` inside a write transaction, committing on `Ok` and aborting on `Err`.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut Rows<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut rows = txn.open_table(ROWS).map_err(map_err!(Table))?;
            f(&mut rows)
        };
        match result {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "transaction abort failed");
                }
                Err(e)
            }
        }
    }

    // ── Prefix maintenance ─────────────────────────────────────────

    /// Delete every row whose key starts with `prefix` in one transaction.
    pub fn drop_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let removed = self.update(|rows| delete_prefix_in(rows, prefix, usize::MAX))?;
        debug!(%prefix, removed, "prefix dropped");
        Ok(removed)
    }

    /// Delete every row under `prefix`, committing after each batch of
    /// `batch_size` rows so a large purge does not hold one huge transaction.
    pub fn delete_prefix_batched(&self, prefix: &str, batch_size: usize) -> StoreResult<u64> {
        let batch_size = batch_size.max(1);
        let mut total = 0;
        loop {
            let removed = self.update(|rows| delete_prefix_in(rows, prefix, batch_size))?;
            total += removed;
            debug!(%prefix, removed, total, "deletion batch committed");
            if removed < batch_size as u64 {
                break;
            }
        }
        info!(%prefix, total, "prefix deleted");
        Ok(total)
    }

    pub fn count_keys(&self, prefix: &str) -> StoreResult<u64> {
        self.view(|rows| {
            let upper = format!("{prefix}{PREFIX_END}");
            let mut count = 0;
            for entry in rows.range(prefix..upper.as_str()).map_err(map_err!(Read))? {
                entry.map_err(map_err!(Read))?;
                count += 1;
            }
            Ok(count)
        })
    }

    /// Bytes of user data and metadata held by the database.
    ///
    /// redb never shrinks its file when rows are deleted, so retention
    /// measures this instead of the file length.
    pub fn footprint_bytes(&self) -> StoreResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stats = txn.stats().map_err(map_err!(Read))?;
        let bytes = stats.stored_bytes() + stats.metadata_bytes();
        txn.abort().map_err(map_err!(Transaction))?;
        Ok(bytes)
    }

    /// Key counts per partition and table. Walks every row.
    pub fn partition_histogram(&self) -> StoreResult<BTreeMap<String, PartitionInfo>> {
        self.view(|rows| {
            let mut histogram: BTreeMap<String, PartitionInfo> = BTreeMap::new();
            for entry in rows.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let key = match AnyKey::parse(key.value()) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "skipping unparseable key");
                        continue;
                    }
                };
                let info = histogram.entry(key.partition_id().to_string()).or_default();
                info.total_keys += 1;
                *info.keys_by_table.entry(key.table().name().to_string()).or_default() += 1;
            }
            Ok(histogram)
        })
    }
}

/// First key under `prefix`, if any.
pub(crate) fn first_key_with_prefix<R: RowSource>(
    rows: &R,
    prefix: &str,
) -> StoreResult<Option<String>> {
    let upper = format!("{prefix}{PREFIX_END}");
    let mut range = rows.range(prefix..upper.as_str()).map_err(map_err!(Read))?;
    match range.next() {
        Some(entry) => {
            let (key, _) = entry.map_err(map_err!(Read))?;
            Ok(Some(key.value().to_string()))
        }
        None => Ok(None),
    }
}

/// Last key under `prefix`, found by seeking back from `prefix + sentinel`.
pub(crate) fn last_key_with_prefix<R: RowSource>(
    rows: &R,
    prefix: &str,
) -> StoreResult<Option<String>> {
    let upper = format!("{prefix}{PREFIX_END}");
    let mut range = rows.range(prefix..upper.as_str()).map_err(map_err!(Read))?;
    match range.next_back() {
        Some(entry) => {
            let (key, _) = entry.map_err(map_err!(Read))?;
            Ok(Some(key.value().to_string()))
        }
        None => Ok(None),
    }
}

/// Remove up to `limit` rows under `prefix`. Returns how many were removed.
pub(crate) fn delete_prefix_in(rows: &mut Rows<'_>, prefix: &str, limit: usize) -> StoreResult<u64> {
    let upper = format!("{prefix}{PREFIX_END}");
    let mut doomed = Vec::new();
    for entry in rows.range(prefix..upper.as_str()).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        doomed.push(key.value().to_string());
        if doomed.len() >= limit {
            break;
        }
    }
    for key in &doomed {
        rows.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(doomed.len() as u64)
}
