//! Watch table updates and previous-observation lookup.

use kubetrail_extract::{KubeMetadata, NODE_KIND, node_has_major_update};
use kubetrail_store::{RowSource, Rows, Tables, WatchKey, WatchRecord};
use tracing::debug;

use crate::error::IngestResult;

/// Most recent stored observation of the record's entity, searching the
/// record's partition first and then older ones.
pub fn previous_watch_record<R: RowSource>(
    tables: &Tables,
    rows: &R,
    record: &WatchRecord,
    metadata: &KubeMetadata,
) -> IngestResult<Option<WatchRecord>> {
    let clock = tables.clock();
    let key = WatchKey::prefix(
        &clock,
        record.timestamp,
        &record.kind,
        &metadata.namespace,
        &metadata.name,
    );
    let comparator = WatchKey::comparator(&record.kind, &metadata.namespace, &metadata.name);
    match tables.watch().previous_key(rows, &key, &comparator) {
        Ok(found) => Ok(Some(tables.watch().get(rows, &found)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Store the record under its timestamped watch key.
///
/// Node records that only refresh heartbeats are dropped unless
/// `keep_minor_node_updates` is set. Returns whether a row was written.
pub fn update_watch(
    tables: &Tables,
    rows: &mut Rows<'_>,
    record: &WatchRecord,
    metadata: &KubeMetadata,
    keep_minor_node_updates: bool,
) -> IngestResult<bool> {
    if record.kind == NODE_KIND && !keep_minor_node_updates {
        if let Some(previous) = previous_watch_record(tables, &*rows, record, metadata)? {
            if !node_has_major_update(&previous.payload, &record.payload)? {
                debug!(name = %metadata.name, "skipping minor node update");
                return Ok(false);
            }
        }
    }

    let key = WatchKey::new(
        &tables.clock(),
        &record.kind,
        &metadata.namespace,
        &metadata.name,
        record.timestamp,
    );
    tables.watch().set(rows, &key, record)?;
    debug!(%key, change = %record.change_type, "watch record stored");
    Ok(true)
}
