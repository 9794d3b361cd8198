//! Ingestion runner — drains the watch channel into the tables.
//!
//! A single task consumes the channel so every write for a given entity
//! happens in arrival order; the event delta engine reads the previous
//! observation and then writes, which concurrent writers would race on.

use std::sync::Arc;

use kubetrail_extract::{
    EVENT_KIND, InvolvedObject, KubeMetadata, POD_KIND, extract_involved_object, extract_metadata,
};
use kubetrail_store::{Tables, WatchRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::update_watch_activity;
use crate::error::IngestResult;
use crate::eventcount::update_event_counts;
use crate::stats::IngestStats;
use crate::summary::{update_relationship, update_resource_summary};
use crate::watch::update_watch;

/// Per-record processing steps, in execution order. Each commits its own
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    EventCount,
    WatchActivity,
    Watch,
    ResourceSummary,
    Relationship,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::EventCount,
        Stage::WatchActivity,
        Stage::Watch,
        Stage::ResourceSummary,
        Stage::Relationship,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::EventCount => "event_count",
            Stage::WatchActivity => "watch_activity",
            Stage::Watch => "watch",
            Stage::ResourceSummary => "resource_summary",
            Stage::Relationship => "relationship",
        }
    }

    /// Whether records of `kind` touch this stage's table. Stages that do
    /// not apply are skipped without opening a transaction.
    pub fn applies_to(self, kind: &str) -> bool {
        match self {
            Stage::EventCount => kind == EVENT_KIND,
            Stage::WatchActivity | Stage::ResourceSummary => kind != EVENT_KIND,
            Stage::Watch => true,
            Stage::Relationship => kind == POD_KIND,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Keep Node updates that only refresh heartbeats.
    pub keep_minor_node_updates: bool,
}

pub struct IngestRunner {
    tables: Tables,
    options: IngestOptions,
    stats: Arc<IngestStats>,
}

impl IngestRunner {
    pub fn new(tables: Tables, options: IngestOptions) -> Self {
        Self {
            tables,
            options,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Apply one record to every table. Failures are logged and counted;
    /// a failing stage does not stop the ones after it.
    pub fn process(&self, record: &WatchRecord) {
        self.stats.record_received();

        let metadata = match extract_metadata(&record.payload) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(kind = %record.kind, error = %e, "rejecting record with unreadable payload");
                self.stats.record_rejected();
                return;
            }
        };
        let involved = if record.kind == EVENT_KIND {
            match extract_involved_object(&record.payload) {
                Ok(involved) => involved,
                Err(e) => {
                    warn!(name = %metadata.name, error = %e, "rejecting event without involved object");
                    self.stats.record_rejected();
                    return;
                }
            }
        } else {
            InvolvedObject::default()
        };

        for stage in Stage::ALL {
            if !stage.applies_to(&record.kind) {
                continue;
            }
            self.stats.stage_run();
            if let Err(e) = self.run_stage(stage, record, &metadata, &involved) {
                warn!(
                    stage = stage.name(),
                    kind = %record.kind,
                    namespace = %metadata.namespace,
                    name = %metadata.name,
                    error = %e,
                    "processing failed"
                );
                self.stats.stage_failed();
            }
        }
        debug!(kind = %record.kind, name = %metadata.name, "record processed");
    }

    fn run_stage(
        &self,
        stage: Stage,
        record: &WatchRecord,
        metadata: &KubeMetadata,
        involved: &InvolvedObject,
    ) -> IngestResult<()> {
        let tables = &self.tables;
        let store = tables.store();
        match stage {
            Stage::EventCount => {
                let written = store
                    .update(|rows| update_event_counts(tables, rows, record, metadata, involved))?;
                self.stats.buckets_written(written);
            }
            Stage::WatchActivity => {
                store.update(|rows| update_watch_activity(tables, rows, record, metadata))?;
            }
            Stage::Watch => {
                let keep_minor = self.options.keep_minor_node_updates;
                let stored =
                    store.update(|rows| update_watch(tables, rows, record, metadata, keep_minor))?;
                if !stored {
                    self.stats.node_update_skipped();
                }
            }
            Stage::ResourceSummary => {
                store.update(|rows| update_resource_summary(tables, rows, record, metadata))?;
            }
            Stage::Relationship => {
                store.update(|rows| update_relationship(tables, rows, record, metadata))?;
            }
        }
        Ok(())
    }

    /// Process records until the channel closes. Records already buffered
    /// when the sender goes away are still processed.
    pub async fn run(self, mut records: mpsc::Receiver<WatchRecord>) {
        info!("ingestion started");
        while let Some(record) = records.recv().await {
            self.process(&record);
        }
        let stats = self.stats.snapshot();
        info!(
            received = stats.records_received,
            rejected = stats.records_rejected,
            stage_failures = stats.stage_failures,
            "ingestion stopped, channel closed"
        );
    }

    pub fn spawn(self, records: mpsc::Receiver<WatchRecord>) -> JoinHandle<()> {
        tokio::spawn(self.run(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use kubetrail_store::{
        ChangeType, Granularity, RelationshipKey, ResourceSummaryKey, Store, StoreError, TableKey,
        WatchActivityKey,
    };

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 15, 10, minute, 0).unwrap()
    }

    fn pod(minute: u32, change_type: ChangeType, version: &str) -> WatchRecord {
        WatchRecord {
            timestamp: at(minute),
            kind: "Pod".into(),
            change_type,
            payload: format!(
                r#"{{"metadata":{{"name":"web-0","namespace":"default","uid":"p1","resourceVersion":"{version}",
                   "creationTimestamp":"2019-01-15T09:00:00Z",
                   "ownerReferences":[{{"kind":"ReplicaSet","name":"web","uid":"rs1"}}]}},
                   "spec":{{"nodeName":"node-1"}}}}"#
            ),
        }
    }

    fn runner() -> IngestRunner {
        let tables = Tables::new(Store::open_in_memory(Granularity::Hour).unwrap());
        IngestRunner::new(tables, IngestOptions::default())
    }

    #[test]
    fn pod_lifecycle_updates_summary_and_activity() {
        let runner = runner();
        runner.process(&pod(1, ChangeType::Add, "1"));
        runner.process(&pod(2, ChangeType::Update, "1"));
        runner.process(&pod(3, ChangeType::Update, "2"));
        runner.process(&pod(4, ChangeType::Delete, "3"));

        let tables = &runner.tables;
        let clock = tables.clock();
        tables
            .store()
            .view(|rows| {
                let key = ResourceSummaryKey::new(&clock, at(0), "Pod", "default", "web-0", "p1");
                let summary = tables.resource_summary().get(rows, &key)?;
                assert_eq!(summary.first_seen, Some(at(1)));
                assert_eq!(summary.last_seen, Some(at(4)));
                assert!(summary.deleted_at_end);
                assert!(summary.create_time.is_some());
                assert_eq!(summary.relationships.len(), 1);
                assert!(summary.relationships[0].contains("/ReplicaSet/default/web/rs1"));

                let key = WatchActivityKey::new(&clock, at(0), "Pod", "default", "web-0", "p1");
                let activity = tables.watch_activity().get(rows, &key)?;
                assert_eq!(activity.no_change_at, vec![at(1).timestamp(), at(2).timestamp()]);
                assert_eq!(activity.changed_at, vec![at(3).timestamp(), at(4).timestamp()]);

                let key = RelationshipKey::new(&clock, at(0), "Pod", "default", "web-0", "p1");
                let relationship = tables.relationship().get(rows, &key)?;
                assert_eq!(relationship.relationships.len(), 2);
                assert!(relationship.relationships[1].ends_with("/Node//node-1"));

                let (watch_rows, _) = tables.watch().range_read(rows, None, |_| true, |_| true, at(0), at(59))?;
                assert_eq!(watch_rows.len(), 4);
                assert!(watch_rows.keys().all(|k| k.partition_id() == clock.partition_id(at(0))));
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let stats = runner.stats().snapshot();
        assert_eq!(stats.records_received, 4);
        assert_eq!(stats.stage_failures, 0);
    }

    #[test]
    fn unreadable_payload_is_rejected() {
        let runner = runner();
        runner.process(&WatchRecord {
            timestamp: at(1),
            kind: "Pod".into(),
            change_type: ChangeType::Add,
            payload: "not json".into(),
        });
        let stats = runner.stats().snapshot();
        assert_eq!(stats.records_rejected, 1);
        assert_eq!(runner.tables.min_max_partition().unwrap(), None);
    }

    #[test]
    fn failing_stage_does_not_block_others() {
        let runner = runner();
        // No uid: the uid-keyed tables reject the key, the watch table does not.
        runner.process(&WatchRecord {
            timestamp: at(1),
            kind: "ConfigMap".into(),
            change_type: ChangeType::Add,
            payload: r#"{"metadata":{"name":"cfg","namespace":"default"}}"#.into(),
        });
        let stats = runner.stats().snapshot();
        assert_eq!(stats.stage_failures, 2);
        let watch_keys = runner.tables.store().count_keys("/watch/").unwrap();
        assert_eq!(watch_keys, 1);
    }

    #[test]
    fn stages_only_run_for_matching_kinds() {
        assert!(Stage::EventCount.applies_to("Event"));
        assert!(!Stage::EventCount.applies_to("Pod"));
        assert!(!Stage::WatchActivity.applies_to("Event"));
        assert!(!Stage::ResourceSummary.applies_to("Event"));
        assert!(Stage::Relationship.applies_to("Pod"));
        assert!(!Stage::Relationship.applies_to("Deployment"));
        assert!(Stage::ALL.iter().all(|stage| stage.applies_to("Pod") || *stage == Stage::EventCount));

        let runner = runner();
        runner.process(&pod(1, ChangeType::Add, "1"));
        runner.process(&WatchRecord {
            timestamp: at(2),
            kind: "ConfigMap".into(),
            change_type: ChangeType::Add,
            payload: r#"{"metadata":{"name":"cfg","namespace":"default","uid":"c1"}}"#.into(),
        });
        runner.process(&WatchRecord {
            timestamp: at(3),
            kind: "Event".into(),
            change_type: ChangeType::Add,
            payload: r#"{"metadata":{"name":"web-0.1","namespace":"default","uid":"e1"},
                "involvedObject":{"kind":"Pod","name":"web-0","namespace":"default","uid":"p1"}}"#
                .into(),
        });

        let stats = runner.stats().snapshot();
        // Pod: activity, watch, summary, relationship. ConfigMap: no
        // relationship. Event: event count and watch only.
        assert_eq!(stats.stages_run, 4 + 3 + 2);
        assert_eq!(stats.stage_failures, 0);
    }

    #[tokio::test]
    async fn run_drains_channel_then_exits() {
        let runner = runner();
        let tables = runner.tables.clone();
        let stats = runner.stats();
        let (tx, rx) = mpsc::channel(4);
        let handle = runner.spawn(rx);

        tx.send(pod(1, ChangeType::Add, "1")).await.unwrap();
        tx.send(pod(2, ChangeType::Update, "2")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(stats.snapshot().records_received, 2);
        assert_eq!(tables.store().count_keys("/watch/").unwrap(), 2);
    }
}
