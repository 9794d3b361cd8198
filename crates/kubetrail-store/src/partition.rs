//! Partition clock.
//!
//! Maps timestamps onto fixed-width partition ids. An id is the Unix-seconds
//! start of the containing hour or day, zero padded to 12 digits, so the
//! string order of ids is their time order.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Number of digits in a partition id.
pub const PARTITION_ID_WIDTH: usize = 12;

/// Supported partition durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    /// Width of one partition in seconds.
    pub fn as_secs(self) -> i64 {
        match self {
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
        }
    }

    /// Width of one partition, for timestamp arithmetic.
    pub fn as_delta(self) -> TimeDelta {
        TimeDelta::seconds(self.as_secs())
    }

    /// Accepts exactly one hour or one day.
    pub fn from_duration(duration: Duration) -> StoreResult<Self> {
        match duration.as_secs() {
            3_600 if duration.subsec_nanos() == 0 => Ok(Granularity::Hour),
            86_400 if duration.subsec_nanos() == 0 => Ok(Granularity::Day),
            _ => Err(StoreError::UnsupportedGranularity(format!("{duration:?}"))),
        }
    }
}

impl FromStr for Granularity {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" | "1h" => Ok(Granularity::Hour),
            "day" | "24h" | "1d" => Ok(Granularity::Day),
            other => Err(StoreError::UnsupportedGranularity(other.to_string())),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Hour => f.write_str("hour"),
            Granularity::Day => f.write_str("day"),
        }
    }
}

/// Converts between timestamps and partition ids for one granularity.
///
/// The clock is a plain value passed to the store, every table and every
/// key constructor. There is no process-wide granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionClock {
    granularity: Granularity,
}

impl PartitionClock {
    pub fn new(granularity: Granularity) -> Self {
        Self { granularity }
    }

    /// Width of the partitions this clock hands out.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Partition id of the hour or day (UTC) containing `at`.
    pub fn partition_id(&self, at: DateTime<Utc>) -> String {
        let secs = at.timestamp();
        let start = secs - secs.rem_euclid(self.granularity.as_secs());
        format!("{start:0width$}", width = PARTITION_ID_WIDTH)
    }

    /// Start instant of a partition.
    ///
    /// Fails with [`StoreError::InvalidPartition`] unless the id is exactly
    /// [`PARTITION_ID_WIDTH`] ASCII digits naming a representable instant. The
    /// id is not required to be aligned to the granularity.
    pub fn partition_start(&self, partition_id: &str) -> StoreResult<DateTime<Utc>> {
        if partition_id.len() != PARTITION_ID_WIDTH
            || !partition_id.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(StoreError::InvalidPartition(partition_id.to_string()));
        }
        let secs: i64 = partition_id
            .parse()
            .map_err(|_| StoreError::InvalidPartition(partition_id.to_string()))?;
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| StoreError::InvalidPartition(partition_id.to_string()))
    }

    /// Half-open `[start, end)` interval covered by a partition.
    pub fn time_range(&self, partition_id: &str) -> StoreResult<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.partition_start(partition_id)?;
        Ok((start, start + self.granularity.as_delta()))
    }

    /// Id of the partition that starts where `partition_id` ends.
    pub fn next_partition(&self, partition_id: &str) -> StoreResult<String> {
        let (_, end) = self.time_range(partition_id)?;
        Ok(self.partition_id(end))
    }

    /// Every partition id from `first` through `last`, ascending.
    ///
    /// Empty when `first` is newer than `last`. Both ids must parse.
    pub fn partitions_between(&self, first: &str, last: &str) -> StoreResult<Vec<String>> {
        // Validate both ends before stepping.
        self.partition_start(last)?;
        let mut current = self.partition_id(self.partition_start(first)?);
        let mut partitions = Vec::new();
        while current.as_str() <= last {
            let next = self.next_partition(&current)?;
            partitions.push(current);
            current = next;
        }
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn hour_partition_floors_to_hour() {
        let clock = PartitionClock::new(Granularity::Hour);
        let t = at(2019, 1, 15, 14, 37, 12);
        let id = clock.partition_id(t);
        assert_eq!(id.len(), PARTITION_ID_WIDTH);
        assert_eq!(clock.partition_start(&id).unwrap(), at(2019, 1, 15, 14, 0, 0));
    }

    #[test]
    fn day_partition_floors_to_midnight_utc() {
        let clock = PartitionClock::new(Granularity::Day);
        let id = clock.partition_id(at(2019, 1, 15, 23, 59, 59));
        assert_eq!(clock.partition_start(&id).unwrap(), at(2019, 1, 15, 0, 0, 0));
    }

    #[test]
    fn time_range_contains_timestamp() {
        for granularity in [Granularity::Hour, Granularity::Day] {
            let clock = PartitionClock::new(granularity);
            for t in [
                at(2020, 2, 29, 0, 0, 0),
                at(2020, 2, 29, 12, 30, 1),
                at(2021, 12, 31, 23, 59, 59),
            ] {
                let (start, end) = clock.time_range(&clock.partition_id(t)).unwrap();
                assert!(start <= t && t < end);
                assert_eq!(end - start, granularity.as_delta());
            }
        }
    }

    #[test]
    fn ids_sort_in_time_order() {
        let clock = PartitionClock::new(Granularity::Hour);
        let early = clock.partition_id(at(2001, 9, 9, 1, 0, 0));
        let late = clock.partition_id(at(2001, 9, 9, 2, 0, 0));
        assert!(early < late);
        assert_eq!(clock.next_partition(&early).unwrap(), late);
    }

    #[test]
    fn partitions_between_is_inclusive() {
        let clock = PartitionClock::new(Granularity::Hour);
        let first = clock.partition_id(at(2019, 3, 1, 10, 5, 0));
        let last = clock.partition_id(at(2019, 3, 1, 12, 59, 0));
        let list = clock.partitions_between(&first, &last).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.first(), Some(&first));
        assert_eq!(list.last(), Some(&last));
        assert!(clock.partitions_between(&last, &first).unwrap().is_empty());
    }

    #[test]
    fn malformed_partition_rejected() {
        let clock = PartitionClock::new(Granularity::Day);
        assert!(matches!(
            clock.partition_start("12345"),
            Err(StoreError::InvalidPartition(_))
        ));
        assert!(clock.partition_start("00000000abcd").is_err());
    }

    #[test]
    fn granularity_parsing() {
        assert_eq!("hour".parse::<Granularity>().unwrap(), Granularity::Hour);
        assert_eq!("24h".parse::<Granularity>().unwrap(), Granularity::Day);
        assert!(matches!(
            "1m".parse::<Granularity>(),
            Err(StoreError::UnsupportedGranularity(_))
        ));
        assert_eq!(
            Granularity::from_duration(Duration::from_secs(3_600)).unwrap(),
            Granularity::Hour
        );
        assert!(Granularity::from_duration(Duration::from_secs(600)).is_err());
    }
}
