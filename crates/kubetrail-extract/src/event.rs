//! Event field extraction.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::error::ExtractResult;
use crate::metadata::{null_as_default, parse_timestamp};

/// Fields of a Kubernetes Event needed for counting.
///
/// Timestamps that are missing or unparseable become the Unix epoch. A
/// negative count is read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventInfo {
    pub reason: String,
    pub event_type: String,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub count: i64,
}

impl EventInfo {
    /// Key under which this event is counted within a minute.
    pub fn reason_key(&self) -> String {
        format!("{}:{}", self.reason, self.event_type)
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawEvent {
    #[serde(deserialize_with = "null_as_default")]
    reason: String,
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    event_type: String,
    first_timestamp: Option<String>,
    last_timestamp: Option<String>,
    count: Option<i64>,
}

pub fn extract_event_info(payload: &str) -> ExtractResult<EventInfo> {
    let raw: RawEvent = serde_json::from_str(payload)?;
    let count = raw.count.unwrap_or_default();
    if count < 0 {
        warn!(reason = %raw.reason, count, "negative event count");
    }
    Ok(EventInfo {
        first_timestamp: timestamp_or_epoch("firstTimestamp", raw.first_timestamp.as_deref()),
        last_timestamp: timestamp_or_epoch("lastTimestamp", raw.last_timestamp.as_deref()),
        reason: raw.reason,
        event_type: raw.event_type,
        count: count.max(0),
    })
}

fn timestamp_or_epoch(field: &str, value: Option<&str>) -> DateTime<Utc> {
    match value {
        Some(value) => parse_timestamp(value).unwrap_or_else(|e| {
            warn!(field, error = %e, "unparseable event timestamp");
            DateTime::<Utc>::default()
        }),
        None => DateTime::<Utc>::default(),
    }
}
