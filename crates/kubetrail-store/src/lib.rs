//! kubetrail-store — partitioned history store for Kubernetes watch data.
//!
//! Backed by [redb](https://docs.rs/redb). Every row lives under a key of the
//! form `/<table>/<partition>/<kind>/<namespace>/<name>/<uid-or-nanoTs>`;
//! the partition segment makes each hour or day of data a contiguous key
//! range, which is what range reads seek over and what retention deletes.
//!
//! # Architecture
//!
//! ```text
//!   PartitionClock ──► key codecs (WatchKey, ResourceSummaryKey, ...)
//!         │                     │
//!         ▼                     ▼
//!   Table<K, V>  ── get / set / range_read / previous_key
//!         │
//!         ▼
//!   Tables ── Store (Arc<redb::Database>, one `rows` table)
//! ```
//!
//! Values are JSON-serialized into redb's `&[u8]` value column. `Store` and
//! `Tables` are `Clone` + `Send` + `Sync` and can be shared across async
//! tasks.

pub mod error;
pub mod keys;
pub mod partition;
pub mod stats;
pub mod store;
pub mod table;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use keys::{
    AnyKey, EventCountKey, RelationshipKey, ResourceSummaryKey, TableKey, TableKind,
    WatchActivityKey, WatchKey,
};
pub use partition::{Granularity, PartitionClock};
pub use stats::RangeReadStats;
pub use store::{PartitionInfo, ReadRows, RowSource, Rows, Store};
pub use table::Table;
pub use tables::Tables;
pub use types::*;
