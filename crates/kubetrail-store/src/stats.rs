//! Range-read statistics.

use std::time::Duration;

use tracing::info;

/// Counters gathered by one [`Table::range_read`](crate::table::Table::range_read).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeReadStats {
    pub table_name: &'static str,
    /// Partitions in which at least one row was visited.
    pub partition_count: usize,
    pub rows_visited: usize,
    pub rows_passed_key_predicate: usize,
    pub rows_passed_value_predicate: usize,
    pub elapsed: Duration,
}

impl RangeReadStats {
    pub fn new(table_name: &'static str) -> Self {
        Self {
            table_name,
            ..Self::default()
        }
    }

    pub fn log(&self, request_id: &str) {
        info!(
            request_id,
            table = self.table_name,
            elapsed_ms = self.elapsed.as_millis() as u64,
            partitions = self.partition_count,
            visited = self.rows_visited,
            passed_key = self.rows_passed_key_predicate,
            passed_value = self.rows_passed_value_predicate,
            "range read finished"
        );
    }
}
