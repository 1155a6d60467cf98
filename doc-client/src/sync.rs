//! Push/pull sync manager (§4.7): drains the mutation log to a remote with
//! retries and cross-tab locking, pulls authoritative changes back with a
//! cursor, and lets mutation-log GC run under the overlay's own CDC discipline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use doc_core::{CollectionOp, PullResponse, Puller, RemoteResolver};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::ClientResult;
use crate::lock::LockController;
use crate::mutation_log;
use crate::overlay::OverlayTransaction;
use crate::store::{KvStore, KvTransaction, SqliteStore};

const META_CURSOR_KEY: &str = "cursor";

pub struct SyncManager {
    store: Arc<SqliteStore>,
    lock: Arc<LockController>,
    db_name: String,
    /// Lease held on the `push:<db_name>`/`pull:<db_name>` advisory locks
    /// (`DatabaseConfig::lock_lease`, 2 minutes by default).
    lock_lease: Duration,
    puller: Option<Arc<dyn Puller>>,
    resolvers: HashMap<String, Arc<dyn RemoteResolver>>,
    /// Guards the singleton in-flight pull so concurrent callers join it
    /// rather than racing a second one (§4.7).
    inflight_pull: Mutex<()>,
    on_events: Box<dyn Fn(Vec<doc_core::ChangeEvent>) + Send + Sync>,
}

impl SyncManager {
    pub fn new(
        store: Arc<SqliteStore>,
        lock: Arc<LockController>,
        db_name: impl Into<String>,
        lock_lease: Duration,
        puller: Option<Arc<dyn Puller>>,
        resolvers: HashMap<String, Arc<dyn RemoteResolver>>,
        on_events: impl Fn(Vec<doc_core::ChangeEvent>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            lock,
            db_name: db_name.into(),
            lock_lease,
            puller,
            resolvers,
            inflight_pull: Mutex::new(()),
            on_events: Box::new(on_events),
        }
    }

    /// Drains every unpushed mutation, then schedules a pull (§4.7 push loop).
    #[tracing::instrument(skip(self))]
    pub async fn push(&self) -> ClientResult<()> {
        loop {
            let lock_name = format!("push:{}", self.db_name);
            let store = self.store.clone();
            let drained = self
                .lock
                .request(&lock_name, self.lock_lease, || {
                    let store = store.clone();
                    async move { Self::drain_one(&store, &self.resolvers).await }
                })
                .await?;

            match drained {
                Some(events) => (self.on_events)(events),
                None => break,
            }
        }
        self.pull().await
    }

    /// Selects the lowest-id unpushed mutation and resolves it one way or
    /// another. Returns `None` once nothing is left to push.
    async fn drain_one(
        store: &Arc<SqliteStore>,
        resolvers: &HashMap<String, Arc<dyn RemoteResolver>>,
    ) -> ClientResult<Option<Vec<doc_core::ChangeEvent>>> {
        let mut probe = store.begin().await?;
        let next = mutation_log::lowest_unpushed(&mut probe).await?;
        probe.rollback().await?;

        let Some(mutation) = next else {
            return Ok(None);
        };

        let Some(resolver) = resolvers.get(&mutation.mutation_name) else {
            tracing::warn!(
                mutation_id = mutation.id,
                mutation_name = %mutation.mutation_name,
                "no remote resolver registered; reverting mutation locally"
            );
            let tx = store.begin().await?;
            let mut overlay = OverlayTransaction::new(tx);
            overlay.gc_mutation(mutation.id).await?;
            let events = overlay.commit().await?;
            return Ok(Some(events));
        };

        let local_result = mutation.local_resolver_result.clone().unwrap_or(Value::Null);
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .without_max_times()
            .build();

        loop {
            match resolver.push(local_result.clone()).await {
                Ok(ack) => {
                    let mut tx = store.begin().await?;
                    mutation_log::mark_pushed(&mut tx, mutation.id, ack.server_mutation_id).await?;
                    tx.commit().await?;
                    resolver.on_success(&ack);
                    return Ok(Some(Vec::new()));
                }
                Err(error) => {
                    let mut tx = store.begin().await?;
                    let failure_count = mutation_log::record_push_attempt(&mut tx, mutation.id).await?;
                    tx.commit().await?;

                    let retryable = resolver.should_retry(failure_count, &error);
                    let delay = backoff.next().filter(|_| retryable);
                    let Some(delay) = delay else {
                        tracing::error!(mutation_id = mutation.id, %error, "permanent push failure, reverting mutation");
                        let tx = store.begin().await?;
                        let mut overlay = OverlayTransaction::new(tx);
                        overlay.gc_mutation(mutation.id).await?;
                        let events = overlay.commit().await?;
                        return Ok(Some(events));
                    };
                    tracing::warn!(mutation_id = mutation.id, %error, attempt = failure_count, "push failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Singleton in-flight pull: concurrent callers serialize on the mutex
    /// and each runs their own pull once it's their turn, since a stale
    /// cursor would otherwise be re-read by a joiner (§4.7).
    #[tracing::instrument(skip(self))]
    pub async fn pull(&self) -> ClientResult<()> {
        let Some(puller) = self.puller.clone() else {
            return Ok(());
        };
        let _guard = self.inflight_pull.lock().await;

        let cursor = self.read_cursor().await?;
        let response = (|| async { puller.pull(cursor.clone()).await })
            .retry(ExponentialBuilder::default().without_max_times())
            .await?;

        self.apply_change(response).await
    }

    async fn read_cursor(&self) -> ClientResult<Option<Value>> {
        let mut tx = self.store.begin().await?;
        let value = tx.get_by_key(doc_core::META_COLLECTION, META_CURSOR_KEY).await?;
        tx.rollback().await?;
        Ok(value)
    }

    /// Applies a pull response authoritatively (§4.7), also usable for
    /// sideband pushes (`Database::apply_change`).
    #[tracing::instrument(skip(self, response))]
    pub async fn apply_change(&self, response: PullResponse) -> ClientResult<()> {
        let lock_name = format!("pull:{}", self.db_name);
        let store = self.store.clone();
        let events = self
            .lock
            .request(&lock_name, self.lock_lease, move || {
                let store = store.clone();
                let response = response.clone();
                async move {
                    let tx = store.begin().await?;
                    let mut overlay = OverlayTransaction::new(tx);

                    let acknowledged =
                        mutation_log::delete_acknowledged(overlay.inner_mut(), response.last_processed_mutation_id).await?;
                    for mutation in acknowledged {
                        overlay.gc_already_deleted_mutation(mutation).await?;
                    }

                    for (collection, ops) in &response.change {
                        for op in ops {
                            match op {
                                CollectionOp::Clear => overlay.apply_authoritative_clear(collection).await?,
                                CollectionOp::Created { key, value } | CollectionOp::Updated { key, value } => {
                                    overlay.apply_authoritative_insert(collection, key, value.clone()).await?
                                }
                                CollectionOp::Deleted { key } => overlay.apply_authoritative_delete(collection, key).await?,
                            }
                        }
                    }

                    if let Some(cursor) = &response.cursor {
                        overlay
                            .inner_mut()
                            .upsert(doc_core::META_COLLECTION, META_CURSOR_KEY, cursor.clone())
                            .await?;
                    }

                    overlay.commit().await
                }
            })
            .await?;

        (self.on_events)(events);
        Ok(())
    }

    /// Spawns the 30-second scheduled pull loop; aborts when the returned
    /// handle is dropped.
    pub fn spawn_scheduled_pull(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            if manager.puller.is_none() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(error) = manager.pull().await {
                    tracing::warn!(%error, "scheduled pull failed");
                }
            }
        })
    }
}
