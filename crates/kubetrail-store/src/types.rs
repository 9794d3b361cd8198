//! Value types stored in each table.
//!
//! Every value is JSON-encoded into redb's `&[u8]` column.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Watch ──────────────────────────────────────────────────────────

/// Kind of change reported by the watch feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    #[default]
    Update,
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => f.write_str("add"),
            ChangeType::Update => f.write_str("update"),
            ChangeType::Delete => f.write_str("delete"),
        }
    }
}

/// One observation from the watch feed. `payload` is the raw object JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub change_type: ChangeType,
    pub payload: String,
}

// ── Resource summary / relationships ───────────────────────────────

/// Lifetime summary of one entity within one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at_end: bool,
    /// Keys of related entities.
    #[serde(default)]
    pub relationships: Vec<String>,
}

/// Parent/child links of one entity; same shape as [`ResourceSummary`].
pub type Relationship = ResourceSummary;

// ── Event counts ───────────────────────────────────────────────────

/// Event counts for one minute, keyed by `reason:type`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    #[serde(default)]
    pub by_reason: BTreeMap<String, i64>,
}

/// Per-minute event counts of one involved object within one partition.
///
/// `by_minute` is keyed by the Unix seconds of the minute. It is `None` only
/// in a stored row that lost its map, which ingestion treats as corrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEventCounts {
    pub by_minute: Option<BTreeMap<i64, EventCounts>>,
}

impl Default for ResourceEventCounts {
    fn default() -> Self {
        Self {
            by_minute: Some(BTreeMap::new()),
        }
    }
}

impl ResourceEventCounts {
    /// Sum of every count in the row.
    pub fn total(&self) -> i64 {
        self.by_minute
            .iter()
            .flat_map(|minutes| minutes.values())
            .flat_map(|counts| counts.by_reason.values())
            .sum()
    }
}

// ── Watch activity ─────────────────────────────────────────────────

/// Unix seconds at which an entity was observed, split by whether its
/// resource version changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchActivity {
    #[serde(default)]
    pub changed_at: Vec<i64>,
    #[serde(default)]
    pub no_change_at: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_counts_default_has_map() {
        assert_eq!(ResourceEventCounts::default().by_minute, Some(BTreeMap::new()));
    }

    #[test]
    fn event_counts_missing_map_decodes_as_none() {
        let decoded: ResourceEventCounts = serde_json::from_str("{}").unwrap();
        assert!(decoded.by_minute.is_none());
        let decoded: ResourceEventCounts = serde_json::from_str(r#"{"by_minute":null}"#).unwrap();
        assert!(decoded.by_minute.is_none());
    }

    #[test]
    fn event_counts_total() {
        let mut minutes = BTreeMap::new();
        let mut counts = EventCounts::default();
        counts.by_reason.insert("BackOff:Warning".into(), 3);
        counts.by_reason.insert("Pulled:Normal".into(), 2);
        minutes.insert(60, counts.clone());
        minutes.insert(120, counts);
        let row = ResourceEventCounts {
            by_minute: Some(minutes),
        };
        assert_eq!(row.total(), 10);
        let json = serde_json::to_string(&row).unwrap();
        let back: ResourceEventCounts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn watch_record_json_shape() {
        let json = r#"{"timestamp":"2019-01-15T14:00:00Z","kind":"Pod","change_type":"add","payload":"{}"}"#;
        let record: WatchRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.change_type, ChangeType::Add);
        assert_eq!(record.kind, "Pod");
    }
}
