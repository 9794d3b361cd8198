//! kubetrail-ingest — turns watch records into table rows.
//!
//! # Architecture
//!
//! ```text
//!   mpsc::Receiver<WatchRecord>
//!              │
//!              ▼
//!        IngestRunner ── extract metadata / involved object
//!              │
//!              ├─► event counts     (delta engine, Events only)
//!              ├─► watch activity   (non-Events)
//!              ├─► watch            (Node heartbeat dedupe)
//!              ├─► resource summary (non-Events)
//!              └─► relationships    (Pods)
//! ```
//!
//! Each stage runs in its own write transaction. A failing stage is logged
//! and counted in [`IngestStats`]; the remaining stages still run.

pub mod activity;
pub mod error;
pub mod eventcount;
pub mod runner;
pub mod stats;
pub mod summary;
pub mod watch;

pub use error::{IngestError, IngestResult};
pub use eventcount::{
    EventDelta, clamp_delta_end, compute_delta, distribute_value, spread_by_minute, truncate_delta,
    truncation_point, update_event_counts,
};
pub use runner::{IngestOptions, IngestRunner, Stage};
pub use stats::{IngestSnapshot, IngestStats};
