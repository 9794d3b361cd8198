//! Watch activity: when an entity was seen, and whether it had changed.

use kubetrail_extract::{EVENT_KIND, KubeMetadata, extract_metadata};
use kubetrail_store::{Rows, Tables, WatchActivityKey, WatchRecord};
use tracing::{trace, warn};

use crate::error::IngestResult;
use crate::watch::previous_watch_record;

/// Append the record's Unix seconds to the entity's `changed_at` or
/// `no_change_at` list. Events are skipped.
pub fn update_watch_activity(
    tables: &Tables,
    rows: &mut Rows<'_>,
    record: &WatchRecord,
    metadata: &KubeMetadata,
) -> IngestResult<()> {
    if record.kind == EVENT_KIND {
        return Ok(());
    }

    let changed = match previous_watch_record(tables, &*rows, record, metadata)? {
        Some(previous) => match extract_metadata(&previous.payload) {
            Ok(previous) => previous.resource_version != metadata.resource_version,
            Err(e) => {
                warn!(name = %metadata.name, error = %e, "unreadable previous observation");
                true
            }
        },
        None => false,
    };

    let key = WatchActivityKey::new(
        &tables.clock(),
        record.timestamp,
        &record.kind,
        &metadata.namespace,
        &metadata.name,
        &metadata.uid,
    );
    let mut activity = tables.watch_activity().get_or_default(&*rows, &key)?;
    let at = record.timestamp.timestamp();
    if changed {
        activity.changed_at.push(at);
    } else {
        activity.no_change_at.push(at);
    }
    tables.watch_activity().set(rows, &key, &activity)?;
    trace!(%key, changed, "watch activity updated");
    Ok(())
}
