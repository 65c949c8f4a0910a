use gazer_vecstore::VecError;
use thiserror::Error;

/// Errors returned by [`SimilarityStore`](crate::SimilarityStore) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: key not found: {0}")]
    NotFound(String),

    #[error("store: key already exists: {0}")]
    Duplicate(String),

    #[error("store: vector error: {0}")]
    Vector(#[from] VecError),

    #[error("store: storage error: {0}")]
    Storage(String),

    #[error("store: serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by tracking and resolution operations.
#[derive(Debug, Error)]
pub enum ReidError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("detector error: {0}")]
    Detect(String),

    #[error("embedding error: {0}")]
    Embed(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("timed out {0}")]
    Timeout(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
