//! The `Database` facade (§6): wires every component together and is the
//! only type application code touches directly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use doc_core::{
    is_reserved_collection, ChangeEvent, Condition, MonotonicClock, PullResponse, Puller,
    RemoteResolver,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broadcaster::{Broadcaster, LocalBroadcaster};
use crate::config::DatabaseConfig;
use crate::errors::{ClientError, ClientResult};
use crate::lock::{LockController, LockStore, MetaLockStore};
use crate::mutation_log;
use crate::overlay::OverlayTransaction;
use crate::query::{QueryEngine, QueryOption, ReactiveQuery};
use crate::store::{KvStore, KvTransaction, SqliteStore};
use crate::sync::SyncManager;
use crate::write_transaction::WriteTransaction;

pub struct Database {
    store: Arc<SqliteStore>,
    queries: Arc<QueryEngine>,
    sync: Arc<SyncManager>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: MonotonicClock,
    config: DatabaseConfig,
    pull_task: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Connects to `config.database_url`, runs migrations for `config.collections`,
    /// and wires the query engine, lock controller, and sync manager together.
    /// `puller`/`resolvers` may be empty for a purely local, unsynced database.
    pub async fn open(
        config: DatabaseConfig,
        puller: Option<Arc<dyn Puller>>,
        resolvers: HashMap<String, Arc<dyn RemoteResolver>>,
    ) -> ClientResult<Self> {
        for collection in &config.collections {
            if is_reserved_collection(&collection.name) {
                return Err(ClientError::ReservedCollection(collection.name.clone()));
            }
        }

        let store = Arc::new(SqliteStore::connect(&config.database_url, config.collections.clone()).await?);
        let queries = Arc::new(QueryEngine::new(store.clone(), config.batch_window));

        let lock_store: Arc<dyn LockStore> = Arc::new(MetaLockStore::new(store.clone()));
        let lock = Arc::new(LockController::new(lock_store, config.lock_poll_interval));

        let broadcaster: Arc<dyn Broadcaster> = Arc::new(LocalBroadcaster::default());
        let fanout_queries = queries.clone();
        let fanout_broadcaster = broadcaster.clone();

        let sync = Arc::new(SyncManager::new(
            store.clone(),
            lock,
            config.database_url.clone(),
            config.lock_lease,
            puller,
            resolvers,
            move |events: Vec<ChangeEvent>| {
                fanout_broadcaster.publish(&events);
                let queries = fanout_queries.clone();
                tokio::spawn(async move { queries.dispatch(&events).await });
            },
        ));

        Ok(Self { store, queries, sync, broadcaster, clock: MonotonicClock::new(), config, pull_task: Mutex::new(None) })
    }

    /// Re-derives nothing persistent (overlay state is always derived fresh
    /// from `__mutations`) — this just starts the scheduled pull loop.
    /// Calling it twice is an error.
    pub async fn initialize(&self) -> ClientResult<()> {
        let mut guard = self.pull_task.lock().await;
        if guard.is_some() {
            return Err(ClientError::AlreadyInitialized);
        }
        tracing::info!(database_url = %self.config.database_url, "initializing database");
        *guard = Some(self.sync.spawn_scheduled_pull(self.config.pull_interval));
        Ok(())
    }

    /// Runs `body` against a fresh mutation row inside one overlay tx. On
    /// `Err`, the tx rolls back and no CDC fires. On `Ok`, the mutation row
    /// is finalized, the tx commits, CDC dispatches to queries and the
    /// broadcaster, and a push is scheduled in the background.
    #[tracing::instrument(skip(self, args, body))]
    pub async fn mutate<T, F, Fut>(&self, name: &str, args: Value, body: F) -> ClientResult<T>
    where
        T: Serialize,
        F: FnOnce(&mut WriteTransaction<'_>) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let tx = self.store.begin().await?;
        let mut overlay = OverlayTransaction::new(tx);
        let mutation_id = mutation_log::begin_mutation(overlay.inner_mut(), name, &args).await?;

        let outcome = {
            let mut write_tx = WriteTransaction::new(&mut overlay, mutation_id, &self.clock);
            body(&mut write_tx).await
        };

        let value = match outcome {
            Ok(value) => value,
            Err(error) => {
                overlay.rollback().await?;
                return Err(error);
            }
        };

        let local_result = serde_json::to_value(&value)?;
        mutation_log::complete_mutation(overlay.inner_mut(), mutation_id, local_result).await?;
        let events = overlay.commit().await?;

        self.broadcaster.publish(&events);
        self.queries.dispatch(&events).await;
        self.schedule_push();

        Ok(value)
    }

    fn schedule_push(&self) {
        let sync = self.sync.clone();
        tokio::spawn(async move {
            if let Err(error) = sync.push().await {
                tracing::warn!(%error, "background push failed");
            }
        });
    }

    pub fn collection(&self, name: impl Into<String>) -> CollectionQuery<'_> {
        CollectionQuery { db: self, collection: name.into() }
    }

    /// Runs `body` inside a fresh read-only overlay tx. Unlike `collection(..).get(..)`,
    /// this does not go through the query engine's batching/cache — it's for
    /// ad hoc multi-read code that doesn't need a live subscription.
    pub async fn batch_read<T, F, Fut>(&self, body: F) -> ClientResult<T>
    where
        F: FnOnce(&mut OverlayTransaction) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let tx = self.store.begin().await?;
        let mut overlay = OverlayTransaction::new(tx);
        let result = body(&mut overlay).await;
        overlay.rollback().await?;
        result
    }

    pub async fn pull(&self) -> ClientResult<()> {
        self.sync.pull().await
    }

    /// Applies a partial pull response received out-of-band (e.g. a live
    /// server push) without going through the `Puller`.
    pub async fn apply_change(&self, response: PullResponse) -> ClientResult<()> {
        self.sync.apply_change(response).await
    }

    pub fn subscribe_to_cdc(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.broadcaster.subscribe()
    }

    pub async fn pending_mutation_count(&self) -> ClientResult<i64> {
        let mut tx = self.store.begin().await?;
        let count = mutation_log::unpushed_count(&mut tx).await?;
        tx.rollback().await?;
        Ok(count)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.pull_task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Borrowed handle scoping `.get`/`.get_all` to one collection name.
pub struct CollectionQuery<'a> {
    db: &'a Database,
    collection: String,
}

impl CollectionQuery<'_> {
    pub async fn get(&self, key: impl Into<String>) -> Arc<ReactiveQuery> {
        self.db
            .queries
            .query(QueryOption::Get { collection: self.collection.clone(), key: key.into() })
            .await
    }

    pub async fn get_all(&self, filter: Option<Condition>) -> Arc<ReactiveQuery> {
        self.db
            .queries
            .query(QueryOption::GetAll { collection: self.collection.clone(), filter })
            .await
    }
}
