//! Event delta engine.
//!
//! Kubernetes Events are cumulative: each update carries the first and last
//! time the event fired and a running count. Storing the raw records would
//! count every occurrence many times over, so each observation is reduced to
//! the part not covered by the previous observation, spread evenly across
//! the minutes it spans and added into the per-minute counts of the object
//! the event is about.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use kubetrail_extract::{
    EVENT_KIND, EventInfo, InvolvedObject, KubeMetadata, extract_event_info,
};
use kubetrail_store::{EventCountKey, PartitionClock, Rows, StoreResult, Tables, WatchRecord};
use tracing::{debug, error, warn};

use crate::error::{IngestError, IngestResult};
use crate::watch::previous_watch_record;

/// The part of an event's count attributed to `[first, last]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDelta {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub count: i64,
}

impl EventDelta {
    fn from_info(info: &EventInfo) -> Self {
        Self {
            first: info.first_timestamp,
            last: info.last_timestamp,
            count: info.count,
        }
    }

    fn zero() -> Self {
        let epoch = DateTime::<Utc>::default();
        Self {
            first: epoch,
            last: epoch,
            count: 0,
        }
    }
}

fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1_000.0
}

/// Portion of `current` not already accounted for by `previous`.
pub fn compute_delta(previous: Option<&EventInfo>, current: &EventInfo) -> EventDelta {
    let Some(previous) = previous else {
        return EventDelta::from_info(current);
    };

    if previous.last_timestamp < current.first_timestamp {
        // A new occurrence of the event after a gap.
        return EventDelta::from_info(current);
    }
    if previous.last_timestamp >= current.last_timestamp {
        // Nothing newer than what was already counted.
        return EventDelta::zero();
    }

    if previous.first_timestamp == current.first_timestamp {
        let count = current.count - previous.count;
        if count < 0 {
            error!(
                reason = %current.reason,
                previous = previous.count,
                current = current.count,
                "event count went backwards"
            );
            return EventDelta::zero();
        }
        return EventDelta {
            first: previous.last_timestamp,
            last: current.last_timestamp,
            count,
        };
    }

    // Partially overlapping intervals. Assume the previous count was spread
    // evenly and discount the overlapping share.
    warn!(reason = %current.reason, "partially overlapping event observations");
    let previous_span = seconds(previous.last_timestamp - previous.first_timestamp);
    if previous_span <= 0.0 {
        return EventDelta::zero();
    }
    let overlap = seconds(previous.last_timestamp - current.first_timestamp);
    let overlapping = (previous.count as f64 * overlap / previous_span) as i64;
    EventDelta {
        first: previous.last_timestamp,
        last: current.last_timestamp,
        count: (current.count - overlapping).max(0),
    }
}

/// Earliest instant a delta may still cover.
///
/// With exactly one partition in the store it is that partition's start;
/// with several, the start of the second-oldest, so nothing is written into
/// the partition retention drops next. Without bounds it falls back to one
/// partition before `last`.
pub fn truncation_point(
    clock: &PartitionClock,
    last: DateTime<Utc>,
    bounds: Option<(&str, &str)>,
) -> StoreResult<DateTime<Utc>> {
    match bounds {
        None => Ok(last - clock.granularity().as_delta()),
        Some((min, max)) if min == max => clock.partition_start(min),
        Some((min, _)) => clock.partition_start(&clock.next_partition(min)?),
    }
}

/// Clip a delta so it starts no earlier than `truncate_at`, scaling the
/// count by the share of the interval that is kept.
pub fn truncate_delta(delta: EventDelta, truncate_at: DateTime<Utc>) -> EventDelta {
    if delta.first >= truncate_at {
        return delta;
    }
    if delta.last <= truncate_at {
        return EventDelta {
            first: truncate_at,
            last: delta.last.max(truncate_at),
            count: 0,
        };
    }
    let total = seconds(delta.last - delta.first);
    let kept = seconds(delta.last - truncate_at);
    EventDelta {
        first: truncate_at,
        last: delta.last,
        count: (delta.count as f64 * (kept / total)) as i64,
    }
}

/// Clip a delta so it ends no later than `end`, scaling the count by the
/// share of the interval that is kept.
pub fn clamp_delta_end(delta: EventDelta, end: DateTime<Utc>) -> EventDelta {
    if delta.last <= end {
        return delta;
    }
    if delta.first >= end {
        return EventDelta {
            first: end,
            last: end,
            count: 0,
        };
    }
    let total = seconds(delta.last - delta.first);
    let kept = seconds(end - delta.first);
    EventDelta {
        first: delta.first,
        last: end,
        count: (delta.count as f64 * (kept / total)) as i64,
    }
}

/// Split `value` into `buckets` near-equal parts, the remainder going to the
/// earliest buckets.
pub fn distribute_value(value: i64, buckets: usize) -> Vec<i64> {
    if buckets == 0 {
        return Vec::new();
    }
    let n = buckets as i64;
    let base = value / n;
    let remainder = value % n;
    (0..n)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Unix seconds of the minute nearest to `at`; half a minute rounds up.
pub fn round_to_minute(at: DateTime<Utc>) -> i64 {
    let secs = at.timestamp();
    let into_minute = secs.rem_euclid(60);
    let floor = secs - into_minute;
    let nanos_into_minute = into_minute * 1_000_000_000 + i64::from(at.timestamp_subsec_nanos());
    if nanos_into_minute >= 30_000_000_000 {
        floor + 60
    } else {
        floor
    }
}

/// Spread a delta over every whole minute from `round(first)` through
/// `round(last)`. Minutes that receive nothing are left out.
pub fn spread_by_minute(delta: &EventDelta) -> BTreeMap<i64, i64> {
    let first = round_to_minute(delta.first);
    let last = round_to_minute(delta.last);
    let mut minutes = BTreeMap::new();
    if delta.count == 0 {
        return minutes;
    }
    if last < first {
        warn!(first = %delta.first, last = %delta.last, "event interval is inverted");
        return minutes;
    }
    let buckets = ((last - first) / 60 + 1) as usize;
    for (i, count) in distribute_value(delta.count, buckets).into_iter().enumerate() {
        if count != 0 {
            minutes.insert(first + 60 * i as i64, count);
        }
    }
    minutes
}

/// Fold an Event record into the event-count table. Returns the number of
/// minute buckets written. Non-Event records are ignored.
pub fn update_event_counts(
    tables: &Tables,
    rows: &mut Rows<'_>,
    record: &WatchRecord,
    metadata: &KubeMetadata,
    involved: &InvolvedObject,
) -> IngestResult<usize> {
    if record.kind != EVENT_KIND {
        return Ok(0);
    }
    let clock = tables.clock();
    let current = extract_event_info(&record.payload)?;
    let previous = match previous_watch_record(tables, &*rows, record, metadata)? {
        Some(previous) => match extract_event_info(&previous.payload) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(name = %metadata.name, error = %e, "ignoring unreadable previous event");
                None
            }
        },
        None => None,
    };

    let zero_time = DateTime::<Utc>::default();
    if current.first_timestamp == zero_time || current.last_timestamp == zero_time {
        warn!(name = %metadata.name, "event without first or last timestamp, not counted");
        return Ok(0);
    }

    let delta = compute_delta(previous.as_ref(), &current);
    if delta.count == 0 {
        debug!(name = %metadata.name, "event adds nothing new");
        return Ok(0);
    }

    // Counts only go into partitions the store already holds: from the
    // truncation point up to the end of the newest partition.
    let Some((min, max)) = tables.min_max_partition_in(&*rows)? else {
        debug!(name = %metadata.name, "store holds no partitions yet, event not counted");
        return Ok(0);
    };
    let truncate_at = truncation_point(&clock, delta.last, Some((min.as_str(), max.as_str())))?;
    let window_end = clock.partition_start(&clock.next_partition(&max)?)?;
    let delta = clamp_delta_end(truncate_delta(delta, truncate_at), window_end);

    // Half-minute rounding can push the final bucket onto `window_end`
    // itself; fold it into the newest partition's last minute.
    let last_minute = window_end.timestamp() - 60;
    let mut minutes: BTreeMap<i64, i64> = BTreeMap::new();
    for (minute, count) in spread_by_minute(&delta) {
        *minutes.entry(minute.min(last_minute)).or_default() += count;
    }
    if minutes.is_empty() {
        return Ok(0);
    }

    let mut by_partition: BTreeMap<String, Vec<(DateTime<Utc>, i64)>> = BTreeMap::new();
    for (&minute, &count) in &minutes {
        let Some(at) = DateTime::from_timestamp(minute, 0) else {
            warn!(minute, "minute out of range");
            continue;
        };
        by_partition
            .entry(clock.partition_id(at))
            .or_default()
            .push((at, count));
    }

    let reason = current.reason_key();
    let table = tables.event_count();
    let mut written = 0;
    for buckets in by_partition.values() {
        let Some(&(first_at, _)) = buckets.first() else {
            continue;
        };
        let key = EventCountKey::new(
            &clock,
            first_at,
            &involved.kind,
            &involved.namespace,
            &involved.name,
            &involved.uid,
        );
        let mut row = table.get_or_default(&*rows, &key)?;
        let Some(by_minute) = row.by_minute.as_mut() else {
            return Err(IngestError::Integrity(format!(
                "event count row {key} has no minute map"
            )));
        };
        for &(at, count) in buckets {
            *by_minute
                .entry(at.timestamp())
                .or_default()
                .by_reason
                .entry(reason.clone())
                .or_default() += count;
            written += 1;
        }
        table.set(rows, &key, &row)?;
    }

    debug!(
        involved = %involved.name,
        %reason,
        count = delta.count,
        buckets = written,
        "event counts merged"
    );
    Ok(written)
}
