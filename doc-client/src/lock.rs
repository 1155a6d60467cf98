//! Advisory lock over persistent storage with a lease timeout (§4.8).
//!
//! Cooperative, not crash-safe: a held lock whose owner crashed is only
//! reclaimed once a waiter's `timeout` elapses and force-removes it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::ClientResult;
use crate::store::{KvStore, KvTransaction, SqliteStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockEntry {
    locked: bool,
    owner_id: Uuid,
}

/// Persistent get/set/remove for one named lock. Default impl lives in
/// `__meta`; nothing else in this crate reaches into `__meta` directly for
/// locks, so a caller can swap in a cross-process store without touching
/// `LockController`.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn read(&self, name: &str) -> ClientResult<Option<Value>>;
    async fn write(&self, name: &str, entry: Value) -> ClientResult<()>;
    async fn remove(&self, name: &str) -> ClientResult<()>;
}

pub struct MetaLockStore {
    store: Arc<SqliteStore>,
}

impl MetaLockStore {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockStore for MetaLockStore {
    async fn read(&self, name: &str) -> ClientResult<Option<Value>> {
        let mut tx = self.store.begin().await?;
        let value = tx.get_by_key(doc_core::META_COLLECTION, name).await?;
        tx.rollback().await?;
        Ok(value)
    }

    async fn write(&self, name: &str, entry: Value) -> ClientResult<()> {
        let mut tx = self.store.begin().await?;
        tx.upsert(doc_core::META_COLLECTION, name, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> ClientResult<()> {
        let mut tx = self.store.begin().await?;
        if tx.get_by_key(doc_core::META_COLLECTION, name).await?.is_some() {
            tx.delete(doc_core::META_COLLECTION, name).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// One process's advisory-mutex client. `owner_id` is a random `Uuid`
/// generated once per `LockController` (i.e. per process/`Database`).
pub struct LockController {
    store: Arc<dyn LockStore>,
    owner_id: Uuid,
    poll_interval: Duration,
}

impl LockController {
    pub fn new(store: Arc<dyn LockStore>, poll_interval: Duration) -> Self {
        Self { store, owner_id: Uuid::new_v4(), poll_interval }
    }

    /// Polls at `poll_interval` until unlocked or already owned by this
    /// instance; force-removes the lock if `timeout` elapses first. Runs
    /// `callback` while held, then releases — including on an early `Err`
    /// return from the callback.
    pub async fn request<F, Fut, T>(&self, name: &str, timeout: Duration, callback: F) -> ClientResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ClientResult<T>>,
    {
        self.acquire(name, timeout).await?;
        let result = callback().await;
        if let Err(error) = self.store.remove(name).await {
            tracing::warn!(lock = name, %error, "failed to release advisory lock");
        }
        result
    }

    async fn acquire(&self, name: &str, timeout: Duration) -> ClientResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.store.read(name).await? {
                None => return self.claim(name).await,
                Some(raw) => {
                    let entry: LockEntry = serde_json::from_value(raw)?;
                    if !entry.locked || entry.owner_id == self.owner_id {
                        return self.claim(name).await;
                    }
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(lock = name, "lock timeout elapsed, force-removing");
                self.store.remove(name).await?;
                return self.claim(name).await;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn claim(&self, name: &str) -> ClientResult<()> {
        let entry = serde_json::to_value(LockEntry { locked: true, owner_id: self.owner_id })?;
        self.store.write(name, entry).await
    }
}
