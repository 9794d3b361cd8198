use kubetrail_extract::ExtractError;
use kubetrail_store::StoreError;
use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("data integrity: {0}")]
    Integrity(String),
}
