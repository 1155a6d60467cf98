use thiserror::Error;

/// Errors surfaced by the client-side engine: `doc_core::DbError` plus the
/// storage and process-local failure modes the SQLite adapter introduces.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    #[error(transparent)]
    Db(#[from] doc_core::DbError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("uuid parsing error: {0}")]
    UuidParse(#[from] uuid::Error),

    #[error("no mutation row found for id {0}")]
    MutationRowMissing(i64),

    #[error("collection {0} is reserved and cannot be declared by the caller")]
    ReservedCollection(String),

    #[error("database already initialized")]
    AlreadyInitialized,
}

pub type ClientResult<T> = Result<T, ClientError>;
