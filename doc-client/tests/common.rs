use std::sync::Arc;

use doc_client::{CollectionMeta, Database, DatabaseConfig, IndexMeta, PullResponse, Puller, RemoteResolver, SqliteStore};

/// Shared fixture collection: a `todo` table with a secondary index on
/// `status`, mirroring the worked examples in the end-to-end scenarios.
pub fn todo_collection() -> CollectionMeta {
    CollectionMeta::new("todo").with_index(IndexMeta::new("status"))
}

pub async fn test_store() -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::connect("sqlite::memory:", vec![todo_collection()])
            .await
            .expect("in-memory sqlite connects"),
    )
}

pub async fn test_database() -> Database {
    test_database_with(None, Default::default()).await
}

pub async fn test_database_with(
    puller: Option<Arc<dyn Puller>>,
    resolvers: std::collections::HashMap<String, Arc<dyn RemoteResolver>>,
) -> Database {
    let config = DatabaseConfig::new("sqlite::memory:").with_collection(todo_collection());
    Database::open(config, puller, resolvers)
        .await
        .expect("database opens")
}

pub struct StaticPuller {
    pub response: PullResponse,
}

#[async_trait::async_trait]
impl Puller for StaticPuller {
    async fn pull(&self, _cursor: Option<serde_json::Value>) -> doc_client::DbResult<PullResponse> {
        Ok(self.response.clone())
    }
}
