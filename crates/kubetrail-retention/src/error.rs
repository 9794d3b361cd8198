use kubetrail_store::{StoreError, TableKind};
use thiserror::Error;

pub type RetentionResult<T> = Result<T, RetentionError>;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One table that could not drop its share of a partition.
#[derive(Debug, Error)]
#[error("failed to drop partition {partition} from {table}: {source}")]
pub struct RetentionFailure {
    pub table: TableKind,
    pub partition: String,
    #[source]
    pub source: StoreError,
}
