//! Key codecs for every table.
//!
//! Keys serialize to `/<table>/<partition>/<kind>/<namespace>/<name>/<last>`
//! where `<last>` is an object uid or, for the watch table, a nanosecond
//! timestamp. Trailing empty segments are dropped when rendering, so a
//! partially filled key doubles as a scan prefix. Parsing is strict: exactly
//! seven `/`-separated segments, an empty first segment and the expected
//! table name.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::partition::PartitionClock;

/// Segment count of a complete key, counting the empty one before the leading `/`.
pub const KEY_SEGMENTS: usize = 7;

/// Upper sentinel appended to a prefix to bound a forward or reverse seek.
pub(crate) const PREFIX_END: char = char::MAX;

/// The tables kept in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    Watch,
    ResourceSummary,
    EventCount,
    WatchActivity,
    Relationship,
}

impl TableKind {
    pub const ALL: [TableKind; 5] = [
        TableKind::Watch,
        TableKind::ResourceSummary,
        TableKind::EventCount,
        TableKind::WatchActivity,
        TableKind::Relationship,
    ];

    /// Name used as the first key segment.
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Watch => "watch",
            TableKind::ResourceSummary => "ressum",
            TableKind::EventCount => "eventcount",
            TableKind::WatchActivity => "watchactivity",
            TableKind::Relationship => "relation",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// `/<table>/`, the prefix shared by every key of the table.
    pub fn prefix(self) -> String {
        format!("/{}/", self.name())
    }

    /// `/<table>/<partition>/`, the prefix shared by one partition of the table.
    pub fn partition_prefix(self, partition_id: &str) -> String {
        format!("/{}/{}/", self.name(), partition_id)
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared behavior of all table keys.
pub trait TableKey: Clone + Eq + Ord + Hash + fmt::Debug + fmt::Display {
    const KIND: TableKind;

    /// Strict inverse of `Display`.
    fn parse(key: &str) -> StoreResult<Self>;

    fn partition_id(&self) -> &str;

    /// Re-target the key at another partition, keeping every other field.
    fn set_partition_id(&mut self, partition_id: &str);

    /// Check the shape of a serialized key.
    fn validate(key: &str) -> StoreResult<()> {
        Self::parse(key).map(|_| ())
    }
}

fn split_key(key: &str, kind: TableKind) -> StoreResult<[&str; KEY_SEGMENTS]> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() != KEY_SEGMENTS {
        return Err(StoreError::InvalidKeyFormat(format!(
            "expected {} segments, got {} in {key:?}",
            KEY_SEGMENTS - 1,
            parts.len().saturating_sub(1)
        )));
    }
    if !parts[0].is_empty() {
        return Err(StoreError::InvalidKeyFormat(format!(
            "key must start with '/': {key:?}"
        )));
    }
    if parts[1] != kind.name() {
        return Err(StoreError::InvalidKeyFormat(format!(
            "expected table {:?} in {key:?}",
            kind.name()
        )));
    }
    parts
        .try_into()
        .map_err(|_| StoreError::InvalidKeyFormat(key.to_string()))
}

fn render(kind: TableKind, partition_id: &str, rest: [&str; 4]) -> String {
    let mut segments = vec![kind.name(), partition_id];
    segments.extend(rest);
    while segments.last().is_some_and(|s| s.is_empty()) {
        segments.pop();
    }
    format!("/{}", segments.join("/"))
}

/// True when `candidate` starts with `prefix` and the match ends on a segment
/// boundary, so `/ressum/P/Pod/ns/web` does not match `/ressum/P/Pod/ns/web-2/..`.
pub(crate) fn matches_prefix(candidate: &str, prefix: &str) -> bool {
    candidate.starts_with(prefix)
        && (prefix.ends_with('/')
            || candidate.len() == prefix.len()
            || candidate.as_bytes()[prefix.len()] == b'/')
}

// ── Watch ──────────────────────────────────────────────────────────

/// Key of one watch observation. Without a timestamp it renders as the
/// prefix covering every observation of the entity in its partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WatchKey {
    pub partition_id: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl WatchKey {
    pub fn new(
        clock: &PartitionClock,
        kind: &str,
        namespace: &str,
        name: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_id: clock.partition_id(timestamp),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            timestamp: Some(timestamp),
        }
    }

    /// Timestamp-less key in the partition containing `at`.
    pub fn prefix(
        clock: &PartitionClock,
        at: DateTime<Utc>,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Self {
        Self {
            partition_id: clock.partition_id(at),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            timestamp: None,
        }
    }

    /// Partition-less key matching every observation of an entity.
    pub fn comparator(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Outside the i64 nanosecond range the timestamp renders as RFC 3339,
        // which `parse` rejects.
        let nanos = self
            .timestamp
            .map(|ts| {
                ts.timestamp_nanos_opt()
                    .map_or_else(|| ts.to_rfc3339(), |nanos| nanos.to_string())
            })
            .unwrap_or_default();
        f.write_str(&render(
            Self::KIND,
            &self.partition_id,
            [&self.kind, &self.namespace, &self.name, &nanos],
        ))
    }
}

impl TableKey for WatchKey {
    const KIND: TableKind = TableKind::Watch;

    fn parse(key: &str) -> StoreResult<Self> {
        let [_, _, partition_id, kind, namespace, name, nanos] = split_key(key, Self::KIND)?;
        let nanos: i64 = nanos.parse().map_err(|_| {
            StoreError::InvalidKeyFormat(format!("bad nanosecond timestamp in {key:?}"))
        })?;
        Ok(Self {
            partition_id: partition_id.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            timestamp: Some(DateTime::from_timestamp_nanos(nanos)),
        })
    }

    fn partition_id(&self) -> &str {
        &self.partition_id
    }

    fn set_partition_id(&mut self, partition_id: &str) {
        self.partition_id = partition_id.to_string();
    }
}

// ── Uid-keyed tables ───────────────────────────────────────────────

macro_rules! entity_key {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name {
            pub partition_id: String,
            pub kind: String,
            pub namespace: String,
            pub name: String,
            pub uid: String,
        }

        impl $name {
            pub fn new(
                clock: &PartitionClock,
                at: DateTime<Utc>,
                kind: &str,
                namespace: &str,
                name: &str,
                uid: &str,
            ) -> Self {
                Self {
                    partition_id: clock.partition_id(at),
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    uid: uid.to_string(),
                }
            }

            /// Partition-less key; empty trailing fields widen the match.
            pub fn comparator(kind: &str, namespace: &str, name: &str, uid: &str) -> Self {
                Self {
                    partition_id: String::new(),
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    uid: uid.to_string(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&render(
                    Self::KIND,
                    &self.partition_id,
                    [&self.kind, &self.namespace, &self.name, &self.uid],
                ))
            }
        }

        impl TableKey for $name {
            const KIND: TableKind = $kind;

            fn parse(key: &str) -> StoreResult<Self> {
                let [_, _, partition_id, kind, namespace, name, uid] =
                    split_key(key, Self::KIND)?;
                Ok(Self {
                    partition_id: partition_id.to_string(),
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    uid: uid.to_string(),
                })
            }

            fn partition_id(&self) -> &str {
                &self.partition_id
            }

            fn set_partition_id(&mut self, partition_id: &str) {
                self.partition_id = partition_id.to_string();
            }
        }
    };
}

entity_key!(
    /// Key of a resource summary row.
    ResourceSummaryKey,
    TableKind::ResourceSummary
);
entity_key!(
    /// Key of the per-minute event counts of one involved object.
    EventCountKey,
    TableKind::EventCount
);
entity_key!(WatchActivityKey, TableKind::WatchActivity);
entity_key!(RelationshipKey, TableKind::Relationship);

// ── Dispatch ───────────────────────────────────────────────────────

/// A key of any table, parsed by its table segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyKey {
    Watch(WatchKey),
    ResourceSummary(ResourceSummaryKey),
    EventCount(EventCountKey),
    WatchActivity(WatchActivityKey),
    Relationship(RelationshipKey),
}

impl AnyKey {
    pub fn parse(key: &str) -> StoreResult<Self> {
        let table = key.split('/').nth(1).unwrap_or_default();
        match TableKind::from_name(table) {
            Some(TableKind::Watch) => WatchKey::parse(key).map(AnyKey::Watch),
            Some(TableKind::ResourceSummary) => {
                ResourceSummaryKey::parse(key).map(AnyKey::ResourceSummary)
            }
            Some(TableKind::EventCount) => EventCountKey::parse(key).map(AnyKey::EventCount),
            Some(TableKind::WatchActivity) => {
                WatchActivityKey::parse(key).map(AnyKey::WatchActivity)
            }
            Some(TableKind::Relationship) => {
                RelationshipKey::parse(key).map(AnyKey::Relationship)
            }
            None => Err(StoreError::InvalidKeyFormat(format!(
                "unknown table {table:?} in {key:?}"
            ))),
        }
    }

    pub fn table(&self) -> TableKind {
        match self {
            AnyKey::Watch(_) => TableKind::Watch,
            AnyKey::ResourceSummary(_) => TableKind::ResourceSummary,
            AnyKey::EventCount(_) => TableKind::EventCount,
            AnyKey::WatchActivity(_) => TableKind::WatchActivity,
            AnyKey::Relationship(_) => TableKind::Relationship,
        }
    }

    pub fn partition_id(&self) -> &str {
        match self {
            AnyKey::Watch(k) => k.partition_id(),
            AnyKey::ResourceSummary(k) => k.partition_id(),
            AnyKey::EventCount(k) => k.partition_id(),
            AnyKey::WatchActivity(k) => k.partition_id(),
            AnyKey::Relationship(k) => k.partition_id(),
        }
    }
}

impl fmt::Display for AnyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyKey::Watch(k) => k.fmt(f),
            AnyKey::ResourceSummary(k) => k.fmt(f),
            AnyKey::EventCount(k) => k.fmt(f),
            AnyKey::WatchActivity(k) => k.fmt(f),
            AnyKey::Relationship(k) => k.fmt(f),
        }
    }
}
