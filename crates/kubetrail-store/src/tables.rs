//! The set of typed tables sharing one store.

use tracing::debug;

use crate::error::StoreResult;
use crate::keys::{
    AnyKey, EventCountKey, RelationshipKey, ResourceSummaryKey, TableKind, WatchActivityKey,
    WatchKey,
};
use crate::partition::PartitionClock;
use crate::store::{RowSource, Store, first_key_with_prefix, last_key_with_prefix};
use crate::table::Table;
use crate::types::{Relationship, ResourceEventCounts, ResourceSummary, WatchActivity, WatchRecord};

/// Handle bundling the store with every typed table. Cheap to clone.
#[derive(Clone)]
pub struct Tables {
    store: Store,
    watch: Table<WatchKey, WatchRecord>,
    resource_summary: Table<ResourceSummaryKey, ResourceSummary>,
    event_count: Table<EventCountKey, ResourceEventCounts>,
    watch_activity: Table<WatchActivityKey, WatchActivity>,
    relationship: Table<RelationshipKey, Relationship>,
}

impl Tables {
    /// Typed tables over `store`, all sharing its partition clock.
    pub fn new(store: Store) -> Self {
        let clock = store.clock();
        Self {
            store,
            watch: Table::new(clock),
            resource_summary: Table::new(clock),
            event_count: Table::new(clock),
            watch_activity: Table::new(clock),
            relationship: Table::new(clock),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The store's partition clock, copied out.
    pub fn clock(&self) -> PartitionClock {
        self.store.clock()
    }

    /// Raw watch records, one row per observation.
    pub fn watch(&self) -> &Table<WatchKey, WatchRecord> {
        &self.watch
    }

    /// Per-object summaries, one row per uid and partition.
    pub fn resource_summary(&self) -> &Table<ResourceSummaryKey, ResourceSummary> {
        &self.resource_summary
    }

    /// Per-minute event counts keyed by the involved object.
    pub fn event_count(&self) -> &Table<EventCountKey, ResourceEventCounts> {
        &self.event_count
    }

    /// When each object was observed, split by whether it changed.
    pub fn watch_activity(&self) -> &Table<WatchActivityKey, WatchActivity> {
        &self.watch_activity
    }

    /// Parent/child links of pods, one row per uid and partition.
    pub fn relationship(&self) -> &Table<RelationshipKey, Relationship> {
        &self.relationship
    }

    /// Names of every table in key order of [`TableKind::ALL`].
    pub fn table_names(&self) -> Vec<&'static str> {
        TableKind::ALL.iter().map(|kind| kind.name()).collect()
    }

    /// Oldest and newest partition across every table, read inside an
    /// existing transaction.
    pub fn min_max_partition_in<R: RowSource>(
        &self,
        rows: &R,
    ) -> StoreResult<Option<(String, String)>> {
        let mut bounds: Option<(String, String)> = None;
        for kind in TableKind::ALL {
            let prefix = kind.prefix();
            let (Some(first), Some(last)) = (
                first_key_with_prefix(rows, &prefix)?,
                last_key_with_prefix(rows, &prefix)?,
            ) else {
                continue;
            };
            let first = AnyKey::parse(&first)?.partition_id().to_string();
            let last = AnyKey::parse(&last)?.partition_id().to_string();
            bounds = Some(match bounds {
                Some((min, max)) => (min.min(first), max.max(last)),
                None => (first, last),
            });
        }
        Ok(bounds)
    }

    /// Oldest and newest partition across every table.
    pub fn min_max_partition(&self) -> StoreResult<Option<(String, String)>> {
        self.store.view(|rows| self.min_max_partition_in(rows))
    }

    /// Every partition id between the global oldest and newest, inclusive.
    pub fn partition_list_in<R: RowSource>(&self, rows: &R) -> StoreResult<Vec<String>> {
        match self.min_max_partition_in(rows)? {
            Some((min, max)) => self.clock().partitions_between(&min, &max),
            None => Ok(Vec::new()),
        }
    }

    /// Like [`partition_list_in`](Self::partition_list_in) in its own read
    /// transaction.
    pub fn partition_list(&self) -> StoreResult<Vec<String>> {
        self.store.view(|rows| self.partition_list_in(rows))
    }

    /// Remove one partition of one table. Returns the number of rows removed.
    pub fn drop_partition(&self, kind: TableKind, partition_id: &str) -> StoreResult<u64> {
        let removed = self.store.drop_prefix(&kind.partition_prefix(partition_id))?;
        debug!(table = kind.name(), %partition_id, removed, "partition dropped");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::partition::Granularity;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 15, 10, 30, 0).unwrap()
    }

    #[test]
    fn global_bounds_span_all_tables() {
        let tables = Tables::new(Store::open_in_memory(Granularity::Hour).unwrap());
        assert_eq!(tables.min_max_partition().unwrap(), None);

        let clock = tables.clock();
        let early = base() - TimeDelta::hours(2);
        let late = base() + TimeDelta::hours(1);
        tables
            .store()
            .update(|rows| {
                let activity = WatchActivityKey::new(&clock, early, "Pod", "ns", "a", "u");
                tables.watch_activity().set(rows, &activity, &WatchActivity::default())?;
                let watch = WatchKey::new(&clock, "Pod", "ns", "a", base());
                tables.watch().set(rows, &watch, &WatchRecord::default())?;
                let counts = EventCountKey::new(&clock, late, "Pod", "ns", "a", "u");
                tables.event_count().set(rows, &counts, &ResourceEventCounts::default())
            })
            .unwrap();

        assert_eq!(
            tables.min_max_partition().unwrap(),
            Some((clock.partition_id(early), clock.partition_id(late)))
        );
        let list = tables.partition_list().unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(list[1], clock.partition_id(early + TimeDelta::hours(1)));
    }

    #[test]
    fn drop_partition_leaves_other_tables() {
        let tables = Tables::new(Store::open_in_memory(Granularity::Day).unwrap());
        let clock = tables.clock();
        tables
            .store()
            .update(|rows| {
                let summary = ResourceSummaryKey::new(&clock, base(), "Pod", "ns", "a", "u");
                tables.resource_summary().set(rows, &summary, &ResourceSummary::default())?;
                let relation = RelationshipKey::new(&clock, base(), "Pod", "ns", "a", "u");
                tables.relationship().set(rows, &relation, &Relationship::default())?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let partition = clock.partition_id(base());
        assert_eq!(tables.drop_partition(TableKind::ResourceSummary, &partition).unwrap(), 1);
        assert_eq!(
            tables.min_max_partition().unwrap(),
            Some((partition.clone(), partition))
        );
    }

    #[test]
    fn names_cover_every_table() {
        let tables = Tables::new(Store::open_in_memory(Granularity::Hour).unwrap());
        assert_eq!(
            tables.table_names(),
            vec!["watch", "ressum", "eventcount", "watchactivity", "relation"]
        );
    }
}
