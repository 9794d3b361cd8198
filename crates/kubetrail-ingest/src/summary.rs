//! Resource summary and relationship upserts.

use chrono::{DateTime, Utc};
use kubetrail_extract::{EVENT_KIND, KubeMetadata, NODE_KIND, POD_KIND, extract_node_name};
use kubetrail_store::{
    ChangeType, RelationshipKey, ResourceSummary, ResourceSummaryKey, Rows, StoreError, Table,
    TableKey, Tables, WatchRecord,
};
use tracing::trace;

use crate::error::IngestResult;

/// Summary keys of the record's owners, in the record's partition.
fn owner_keys(tables: &Tables, at: DateTime<Utc>, metadata: &KubeMetadata) -> Vec<String> {
    let clock = tables.clock();
    metadata
        .owner_references
        .iter()
        .map(|owner| {
            ResourceSummaryKey::new(
                &clock,
                at,
                &owner.kind,
                &metadata.namespace,
                &owner.name,
                &owner.uid,
            )
            .to_string()
        })
        .collect()
}

/// Load the row for `key` and apply one observation to it.
fn observe<K: TableKey>(
    table: &Table<K, ResourceSummary>,
    rows: &Rows<'_>,
    key: &K,
    record: &WatchRecord,
    metadata: &KubeMetadata,
) -> IngestResult<ResourceSummary> {
    let mut summary = match table.get(rows, key) {
        Ok(mut existing) => {
            if record.change_type == ChangeType::Add {
                existing.first_seen = Some(record.timestamp);
            }
            existing
        }
        Err(StoreError::NotFound(_)) => ResourceSummary {
            first_seen: Some(record.timestamp),
            create_time: metadata.created_at(),
            ..ResourceSummary::default()
        },
        Err(e) => return Err(e.into()),
    };
    summary.last_seen = Some(record.timestamp);
    if record.change_type == ChangeType::Delete {
        summary.deleted_at_end = true;
    }
    Ok(summary)
}

/// Upsert the entity's summary row. Events are skipped.
pub fn update_resource_summary(
    tables: &Tables,
    rows: &mut Rows<'_>,
    record: &WatchRecord,
    metadata: &KubeMetadata,
) -> IngestResult<()> {
    if record.kind == EVENT_KIND {
        return Ok(());
    }
    let key = ResourceSummaryKey::new(
        &tables.clock(),
        record.timestamp,
        &record.kind,
        &metadata.namespace,
        &metadata.name,
        &metadata.uid,
    );
    let table = tables.resource_summary();
    let mut summary = observe(table, rows, &key, record, metadata)?;
    summary.relationships = owner_keys(tables, record.timestamp, metadata);
    table.set(rows, &key, &summary)?;
    trace!(%key, "resource summary updated");
    Ok(())
}

/// Upsert the relationship row of a Pod: its owners and the node it runs on.
/// Other kinds are skipped.
pub fn update_relationship(
    tables: &Tables,
    rows: &mut Rows<'_>,
    record: &WatchRecord,
    metadata: &KubeMetadata,
) -> IngestResult<()> {
    if record.kind != POD_KIND {
        return Ok(());
    }
    let clock = tables.clock();
    let key = RelationshipKey::new(
        &clock,
        record.timestamp,
        &record.kind,
        &metadata.namespace,
        &metadata.name,
        &metadata.uid,
    );
    let table = tables.relationship();
    let mut relationship = observe(table, rows, &key, record, metadata)?;

    let mut related = owner_keys(tables, record.timestamp, metadata);
    if let Some(node) = extract_node_name(&record.payload)? {
        related.push(
            ResourceSummaryKey::new(&clock, record.timestamp, NODE_KIND, "", &node, "")
                .to_string(),
        );
    }
    for link in related {
        if !relationship.relationships.contains(&link) {
            relationship.relationships.push(link);
        }
    }

    table.set(rows, &key, &relationship)?;
    trace!(%key, links = relationship.relationships.len(), "relationship updated");
    Ok(())
}
