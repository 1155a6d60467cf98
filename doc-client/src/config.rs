use std::time::Duration;

use doc_core::CollectionMeta;

/// Configuration passed to `Database::open`. `Default` reproduces the
/// documented constants (§7.1).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub collections: Vec<CollectionMeta>,
    /// Lease held by the sync manager while draining the push queue.
    pub lock_lease: Duration,
    pub pull_interval: Duration,
    /// Window over which the query engine batches concurrent initial reads.
    pub batch_window: Duration,
    /// Default timeout for `LockController::request`.
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            collections: Vec::new(),
            lock_lease: Duration::from_secs(120),
            pull_interval: Duration::from_secs(30),
            batch_window: Duration::from_millis(5),
            lock_timeout: Duration::from_secs(300),
            lock_poll_interval: Duration::from_secs(1),
        }
    }
}

impl DatabaseConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self { database_url: database_url.into(), ..Self::default() }
    }

    pub fn with_collection(mut self, collection: CollectionMeta) -> Self {
        self.collections.push(collection);
        self
    }
}
