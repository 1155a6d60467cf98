use thiserror::Error;

/// Errors raised by the overlay engine, independent of any concrete KV adapter.
///
/// Adapter crates (e.g. the SQLite-backed one in `doc-client`) wrap this in their
/// own error type and add storage-specific variants via `#[from]`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DbError {
    #[error("document {key} already exists in collection {collection}")]
    DuplicateKey { collection: String, key: String },

    #[error("document {key} not found in collection {collection}")]
    KeyNotFound { collection: String, key: String },

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("failed to apply patch: {0}")]
    PatchFailed(String),

    #[error("remote operation failed: {0}")]
    Remote(String),

    #[error("failed to acquire lock {0} within the configured timeout")]
    LockTimeout(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;
