//! Generic table engine.
//!
//! One `Table<K, V>` serves every table: the key type supplies the table
//! name and the key codec, the value is JSON-encoded. Tables are stateless
//! handles; every operation runs against rows borrowed from a transaction
//! opened with [`Store::view`](crate::Store::view) or
//! [`Store::update`](crate::Store::update).

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::error::{StoreError, StoreResult, map_err};
use crate::keys::{PREFIX_END, TableKey, matches_prefix};
use crate::partition::PartitionClock;
use crate::stats::RangeReadStats;
use crate::store::{RowSource, Rows, first_key_with_prefix, last_key_with_prefix};

pub struct Table<K, V> {
    clock: PartitionClock,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        Self {
            clock: self.clock,
            _types: PhantomData,
        }
    }
}

impl<K, V> Table<K, V>
where
    K: TableKey,
    V: Serialize + DeserializeOwned + Default,
{
    /// Handle for the table named by `K`. Holds no rows itself.
    pub fn new(clock: PartitionClock) -> Self {
        Self {
            clock,
            _types: PhantomData,
        }
    }

    /// First key segment, e.g. `watch` or `eventcount`.
    pub fn name(&self) -> &'static str {
        K::KIND.name()
    }

    pub fn clock(&self) -> &PartitionClock {
        &self.clock
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> StoreResult<V> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Decode(format!("{}: {key}: {e}", self.name())))
    }

    // ── Point operations ───────────────────────────────────────────

    /// Write `value` under `key`, replacing any previous row.
    ///
    /// The rendered key must parse back as a complete key, so prefixes and
    /// watch keys whose timestamp has no nanosecond form are rejected with
    /// [`StoreError::InvalidKeyFormat`].
    pub fn set(&self, rows: &mut Rows<'_>, key: &K, value: &V) -> StoreResult<()> {
        let key = key.to_string();
        K::validate(&key)?;
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        rows.insert(key.as_str(), bytes.as_slice())
            .map_err(map_err!(Write))?;
        trace!(table = self.name(), %key, "row stored");
        Ok(())
    }

    /// Read and decode the row under `key`.
    ///
    /// Returns [`StoreError::NotFound`] for a missing row and
    /// [`StoreError::Decode`] when the stored bytes are not a `V`.
    pub fn get<R: RowSource>(&self, rows: &R, key: &K) -> StoreResult<V> {
        let key = key.to_string();
        K::validate(&key)?;
        match rows.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => self.decode(&key, guard.value()),
            None => Err(StoreError::NotFound(key)),
        }
    }

    /// Like [`get`](Self::get) but a missing row yields `V::default()`.
    pub fn get_or_default<R: RowSource>(&self, rows: &R, key: &K) -> StoreResult<V> {
        match self.get(rows, key) {
            Err(StoreError::NotFound(_)) => Ok(V::default()),
            other => other,
        }
    }

    /// Returns true if the row existed.
    pub fn delete(&self, rows: &mut Rows<'_>, key: &K) -> StoreResult<bool> {
        let key = key.to_string();
        let existed = rows.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        trace!(table = self.name(), %key, existed, "row deleted");
        Ok(existed)
    }

    // ── Range reads ────────────────────────────────────────────────

    /// Rows in partitions `[partition_id(start), partition_id(end)]`.
    ///
    /// `prefix` narrows each partition to keys sharing its non-partition
    /// fields. `key_predicate` sees the raw key before anything is decoded;
    /// `value_predicate` sees the decoded value. Rows whose key or value
    /// cannot be decoded are logged and skipped.
    pub fn range_read<R: RowSource>(
        &self,
        rows: &R,
        prefix: Option<&K>,
        key_predicate: impl Fn(&str) -> bool,
        value_predicate: impl Fn(&V) -> bool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<(BTreeMap<K, V>, RangeReadStats)> {
        let started = Instant::now();
        let mut stats = RangeReadStats::new(self.name());
        let mut found = BTreeMap::new();

        let Some((min_partition, max_partition)) = self.min_max_partitions(rows)? else {
            stats.elapsed = started.elapsed();
            return Ok((found, stats));
        };
        let first = self.clock.partition_id(start).max(min_partition);
        let last = self.clock.partition_id(end).min(max_partition);

        for partition in self.clock.partitions_between(&first, &last)? {
            let seek = match prefix {
                Some(prefix) => {
                    let mut prefix = prefix.clone();
                    prefix.set_partition_id(&partition);
                    prefix.to_string()
                }
                None => K::KIND.partition_prefix(&partition),
            };
            let upper = format!("{seek}{PREFIX_END}");

            let mut touched = false;
            for entry in rows.range(seek.as_str()..upper.as_str()).map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let raw_key = key.value();
                if !matches_prefix(raw_key, &seek) {
                    continue;
                }
                touched = true;
                stats.rows_visited += 1;

                if !key_predicate(raw_key) {
                    continue;
                }
                stats.rows_passed_key_predicate += 1;

                let parsed = match K::parse(raw_key) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(table = self.name(), key = raw_key, error = %e, "skipping row with bad key");
                        continue;
                    }
                };
                let decoded = match self.decode(raw_key, value.value()) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(table = self.name(), key = raw_key, error = %e, "skipping undecodable row");
                        continue;
                    }
                };
                if !value_predicate(&decoded) {
                    continue;
                }
                stats.rows_passed_value_predicate += 1;
                found.insert(parsed, decoded);
            }
            if touched {
                stats.partition_count += 1;
            }
        }

        stats.elapsed = started.elapsed();
        Ok((found, stats))
    }

    // ── Boundaries ─────────────────────────────────────────────────

    /// Smallest key in the table, unparsed.
    pub fn min_key<R: RowSource>(&self, rows: &R) -> StoreResult<Option<String>> {
        first_key_with_prefix(rows, &K::KIND.prefix())
    }

    /// Largest key in the table, unparsed.
    pub fn max_key<R: RowSource>(&self, rows: &R) -> StoreResult<Option<String>> {
        last_key_with_prefix(rows, &K::KIND.prefix())
    }

    /// Oldest and newest partition holding a row of this table.
    pub fn min_max_partitions<R: RowSource>(
        &self,
        rows: &R,
    ) -> StoreResult<Option<(String, String)>> {
        let (Some(min), Some(max)) = (self.min_key(rows)?, self.max_key(rows)?) else {
            return Ok(None);
        };
        let min = K::parse(&min)?;
        let max = K::parse(&max)?;
        Ok(Some((
            min.partition_id().to_string(),
            max.partition_id().to_string(),
        )))
    }

    /// Every partition id from the oldest through the newest, stepping by
    /// the granularity. Gaps are included.
    pub fn unique_partition_list<R: RowSource>(&self, rows: &R) -> StoreResult<Vec<String>> {
        match self.min_max_partitions(rows)? {
            Some((min, max)) => self.clock.partitions_between(&min, &max),
            None => Ok(Vec::new()),
        }
    }

    // ── Previous key ───────────────────────────────────────────────

    /// Largest key strictly less than `key` whose non-partition fields match
    /// `comparator`.
    ///
    /// The partition of `key` is searched first, then older partitions from
    /// newest to oldest. A `key` that is not a complete key (a watch key
    /// without timestamp, say) stands for all of its extensions, so the
    /// newest matching row of its partition qualifies.
    pub fn previous_key<R: RowSource>(&self, rows: &R, key: &K, comparator: &K) -> StoreResult<K> {
        let key_str = key.to_string();
        let upper = if K::validate(&key_str).is_ok() {
            key_str.clone()
        } else {
            format!("{key_str}{PREFIX_END}")
        };

        let current = key.partition_id();
        if let Some(found) = self.last_match_in_partition(rows, current, comparator, Some(&upper))? {
            return Ok(found);
        }
        for partition in self.unique_partition_list(rows)?.iter().rev() {
            if partition.as_str() >= current {
                continue;
            }
            if let Some(found) = self.last_match_in_partition(rows, partition, comparator, None)? {
                return Ok(found);
            }
        }
        Err(StoreError::NotFound(format!(
            "no key before {key_str} matching {comparator}"
        )))
    }

    fn last_match_in_partition<R: RowSource>(
        &self,
        rows: &R,
        partition: &str,
        comparator: &K,
        upper: Option<&str>,
    ) -> StoreResult<Option<K>> {
        let mut scan = comparator.clone();
        scan.set_partition_id(partition);
        let lower = scan.to_string();
        let prefix_end = format!("{lower}{PREFIX_END}");
        let upper = match upper {
            Some(upper) if upper < prefix_end.as_str() => upper,
            _ => prefix_end.as_str(),
        };
        if upper <= lower.as_str() {
            return Ok(None);
        }

        for entry in rows.range(lower.as_str()..upper).map_err(map_err!(Read))?.rev() {
            let (candidate, _) = entry.map_err(map_err!(Read))?;
            let candidate = candidate.value();
            if !matches_prefix(candidate, &lower) {
                continue;
            }
            match K::parse(candidate) {
                Ok(found) => return Ok(Some(found)),
                Err(e) => warn!(table = self.name(), key = candidate, error = %e, "skipping row with bad key"),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ResourceSummaryKey, WatchKey};
    use crate::partition::Granularity;
    use crate::store::Store;
    use crate::types::{ChangeType, ResourceSummary, WatchRecord};
    use chrono::{TimeDelta, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 15, 10, 0, 0).unwrap()
    }

    fn record(at: DateTime<Utc>, payload: &str) -> WatchRecord {
        WatchRecord {
            timestamp: at,
            kind: "Pod".into(),
            change_type: ChangeType::Update,
            payload: payload.into(),
        }
    }

    fn setup() -> (Store, Table<WatchKey, WatchRecord>) {
        let store = Store::open_in_memory(Granularity::Hour).unwrap();
        let table = Table::new(store.clock());
        (store, table)
    }

    fn put_watch(store: &Store, table: &Table<WatchKey, WatchRecord>, name: &str, at: DateTime<Utc>) -> WatchKey {
        let key = WatchKey::new(&store.clock(), "Pod", "default", name, at);
        store
            .update(|rows| table.set(rows, &key, &record(at, name)))
            .unwrap();
        key
    }

    #[test]
    fn set_get_and_default() {
        let store = Store::open_in_memory(Granularity::Hour).unwrap();
        let table: Table<ResourceSummaryKey, ResourceSummary> = Table::new(store.clock());
        let key = ResourceSummaryKey::new(&store.clock(), base(), "Pod", "ns", "web", "u1");
        let summary = ResourceSummary {
            first_seen: Some(base()),
            deleted_at_end: true,
            ..ResourceSummary::default()
        };
        store.update(|rows| table.set(rows, &key, &summary)).unwrap();

        store
            .view(|rows| {
                assert_eq!(table.get(rows, &key)?, summary);
                let other = ResourceSummaryKey::new(&store.clock(), base(), "Pod", "ns", "db", "u2");
                assert!(table.get(rows, &other).unwrap_err().is_not_found());
                assert_eq!(table.get_or_default(rows, &other)?, ResourceSummary::default());
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn set_rejects_incomplete_key() {
        let (store, table) = setup();
        let key = WatchKey::prefix(&store.clock(), base(), "Pod", "ns", "web");
        let err = store
            .update(|rows| table.set(rows, &key, &WatchRecord::default()))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKeyFormat(_)));
    }

    #[test]
    fn set_rejects_timestamp_past_nanosecond_range() {
        let (store, table) = setup();
        let far = Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap();
        let key = WatchKey::new(&store.clock(), "Pod", "ns", "web", far);
        let err = store
            .update(|rows| table.set(rows, &key, &WatchRecord::default()))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKeyFormat(_)));
        assert_eq!(store.count_keys("/watch/").unwrap(), 0);
    }

    #[test]
    fn get_surfaces_decode_errors() {
        let (store, table) = setup();
        let key = WatchKey::new(&store.clock(), "Pod", "ns", "web", base());
        store
            .update(|rows| {
                rows.insert(key.to_string().as_str(), b"not json".as_slice())
                    .map_err(map_err!(Write))?;
                Ok::<_, StoreError>(())
            })
            .unwrap();
        let err = store.view(|rows| table.get(rows, &key)).unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn delete_reports_existence() {
        let (store, table) = setup();
        let key = put_watch(&store, &table, "web", base());
        assert!(store.update(|rows| table.delete(rows, &key)).unwrap());
        assert!(!store.update(|rows| table.delete(rows, &key)).unwrap());
    }

    #[test]
    fn range_read_respects_partition_window() {
        let (store, table) = setup();
        put_watch(&store, &table, "a", base() - TimeDelta::hours(1));
        put_watch(&store, &table, "b", base() + TimeDelta::minutes(5));
        put_watch(&store, &table, "c", base() + TimeDelta::minutes(70));
        put_watch(&store, &table, "d", base() + TimeDelta::hours(3));

        let (found, stats) = store
            .view(|rows| {
                table.range_read(
                    rows,
                    None,
                    |_| true,
                    |_| true,
                    base(),
                    base() + TimeDelta::minutes(90),
                )
            })
            .unwrap();
        let names: Vec<_> = found.keys().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(stats.table_name, "watch");
        assert_eq!(stats.partition_count, 2);
        assert_eq!(stats.rows_visited, 2);
        assert_eq!(stats.rows_passed_value_predicate, 2);
        stats.log("window");
    }

    #[test]
    fn range_read_applies_prefix_and_predicates() {
        let (store, table) = setup();
        put_watch(&store, &table, "web", base() + TimeDelta::minutes(1));
        put_watch(&store, &table, "web", base() + TimeDelta::minutes(2));
        put_watch(&store, &table, "web-2", base() + TimeDelta::minutes(3));
        put_watch(&store, &table, "db", base() + TimeDelta::minutes(4));

        let prefix = WatchKey::comparator("Pod", "default", "web");
        let (found, stats) = store
            .view(|rows| {
                table.range_read(
                    rows,
                    Some(&prefix),
                    |_| true,
                    |_| true,
                    base(),
                    base() + TimeDelta::minutes(59),
                )
            })
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.keys().all(|k| k.name == "web"));
        assert_eq!(stats.rows_visited, 2);

        let (found, stats) = store
            .view(|rows| {
                table.range_read(
                    rows,
                    None,
                    |key| !key.contains("/db/"),
                    |value: &WatchRecord| value.payload != "web-2",
                    base(),
                    base(),
                )
            })
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(stats.rows_visited, 4);
        assert_eq!(stats.rows_passed_key_predicate, 3);
        assert_eq!(stats.rows_passed_value_predicate, 2);
    }

    #[test]
    fn range_read_skips_undecodable_rows() {
        let (store, table) = setup();
        put_watch(&store, &table, "good", base() + TimeDelta::minutes(1));
        let bad = WatchKey::new(&store.clock(), "Pod", "default", "bad", base() + TimeDelta::minutes(2));
        store
            .update(|rows| {
                rows.insert(bad.to_string().as_str(), b"{".as_slice())
                    .map_err(map_err!(Write))?;
                Ok::<_, StoreError>(())
            })
            .unwrap();
        let (found, stats) = store
            .view(|rows| table.range_read(rows, None, |_| true, |_| true, base(), base()))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(stats.rows_visited, 2);
        assert_eq!(stats.rows_passed_value_predicate, 1);
    }

    #[test]
    fn range_read_on_empty_table() {
        let (store, table) = setup();
        let (found, stats) = store
            .view(|rows| table.range_read(rows, None, |_| true, |_| true, base(), base()))
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(stats.partition_count, 0);
    }

    #[test]
    fn min_max_and_partition_list() {
        let (store, table) = setup();
        let clock = store.clock();
        store
            .view(|rows| {
                assert_eq!(table.min_max_partitions(rows)?, None);
                assert!(table.unique_partition_list(rows)?.is_empty());
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let first = put_watch(&store, &table, "a", base());
        let last = put_watch(&store, &table, "b", base() + TimeDelta::hours(3));
        store
            .view(|rows| {
                assert_eq!(table.min_key(rows)?, Some(first.to_string()));
                assert_eq!(table.max_key(rows)?, Some(last.to_string()));
                assert_eq!(
                    table.min_max_partitions(rows)?,
                    Some((first.partition_id.clone(), last.partition_id.clone()))
                );
                let list = table.unique_partition_list(rows)?;
                assert_eq!(list.len(), 4);
                assert_eq!(list[1], clock.partition_id(base() + TimeDelta::hours(1)));
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn previous_key_within_partition() {
        let (store, table) = setup();
        let k1 = put_watch(&store, &table, "web", base() + TimeDelta::minutes(1));
        let k2 = put_watch(&store, &table, "web", base() + TimeDelta::minutes(2));
        put_watch(&store, &table, "web-2", base() + TimeDelta::minutes(3));
        let comparator = WatchKey::comparator("Pod", "default", "web");

        store
            .view(|rows| {
                assert_eq!(table.previous_key(rows, &k2, &comparator)?, k1);
                assert!(table.previous_key(rows, &k1, &comparator).unwrap_err().is_not_found());
                let prefix = WatchKey::prefix(&store.clock(), base(), "Pod", "default", "web");
                assert_eq!(table.previous_key(rows, &prefix, &comparator)?, k2);
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn previous_key_walks_back_across_partitions() {
        let (store, table) = setup();
        let p1 = put_watch(&store, &table, "web", base() + TimeDelta::minutes(10));
        let p2 = put_watch(&store, &table, "web", base() + TimeDelta::minutes(70));
        put_watch(&store, &table, "other", base() + TimeDelta::minutes(130));
        let p3 = put_watch(&store, &table, "web", base() + TimeDelta::minutes(140));
        let comparator = WatchKey::comparator("Pod", "default", "web");

        store
            .view(|rows| {
                // Nothing earlier in P3, so the newest match in P2 wins.
                assert_eq!(table.previous_key(rows, &p3, &comparator)?, p2);
                // Nothing earlier in P2, so fall back to P1.
                assert_eq!(table.previous_key(rows, &p2, &comparator)?, p1);
                Ok::<_, StoreError>(())
            })
            .unwrap();

        store
            .update(|rows| {
                table.delete(rows, &p2)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();
        store
            .view(|rows| {
                assert_eq!(table.previous_key(rows, &p3, &comparator)?, p1);
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn previous_key_on_uid_table_returns_row_from_older_partition() {
        let store = Store::open_in_memory(Granularity::Hour).unwrap();
        let clock = store.clock();
        let table: Table<ResourceSummaryKey, ResourceSummary> = Table::new(clock);
        let older = ResourceSummaryKey::new(&clock, base(), "Pod", "ns", "web", "u1");
        let newer = ResourceSummaryKey::new(&clock, base() + TimeDelta::hours(2), "Pod", "ns", "web", "u1");
        store
            .update(|rows| {
                table.set(rows, &older, &ResourceSummary::default())?;
                table.set(rows, &newer, &ResourceSummary::default())
            })
            .unwrap();

        let comparator = ResourceSummaryKey::comparator("Pod", "ns", "web", "u1");
        let found = store
            .view(|rows| table.previous_key(rows, &newer, &comparator))
            .unwrap();
        assert_eq!(found, older);
    }
}
