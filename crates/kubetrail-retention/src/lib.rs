//! kubetrail-retention — bounded history for the kubetrail store.
//!
//! The store grows by one partition per hour or day. [`RetentionManager`]
//! removes the oldest one, across every table at once, whenever the data
//! is older than the configured lookback or larger than the size budget.

pub mod error;
pub mod manager;

pub use error::{RetentionError, RetentionFailure, RetentionResult};
pub use manager::{
    CycleOutcome, PartitionDropper, RetentionConfig, RetentionManager, RetentionSnapshot,
    RetentionStats, Trigger,
};
