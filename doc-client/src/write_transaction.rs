//! The user-facing collection-scoped mutator surface (§4.6), handed to the
//! closure passed to `Database::mutate`.

use doc_core::{ChangeEvent, DbError, MonotonicClock, PendingChange, Row};
use serde_json::Value;

use crate::errors::ClientResult;
use crate::mutation_log;
use crate::overlay::OverlayTransaction;

/// Bound to one in-flight mutation row; every recorded change is appended to
/// it and persisted before the closure returns.
pub struct WriteTransaction<'a> {
    overlay: &'a mut OverlayTransaction,
    mutation_id: i64,
    clock: &'a MonotonicClock,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(overlay: &'a mut OverlayTransaction, mutation_id: i64, clock: &'a MonotonicClock) -> Self {
        Self { overlay, mutation_id, clock }
    }

    pub fn collection<'b>(&'b mut self, name: impl Into<String>) -> CollectionHandle<'a, 'b> {
        CollectionHandle { tx: self, collection: name.into() }
    }

    pub async fn get_by_key(&mut self, collection: &str, key: &str) -> ClientResult<Option<Value>> {
        self.overlay.get_by_key(collection, key).await
    }

    pub async fn get_all(&mut self, collection: &str) -> ClientResult<Vec<Row>> {
        self.overlay.get_all(collection).await
    }

    fn next_id(&self, timestamp: i64) -> String {
        format!("{}-{timestamp}", self.mutation_id)
    }

    async fn insert(&mut self, collection: &str, key: &str, value: Value) -> ClientResult<()> {
        let event = self.overlay.record_optimistic_insert(collection, key, value).await?;
        let ChangeEvent::Insert { value, .. } = event else {
            return Err(DbError::Internal("record_optimistic_insert returned non-Insert event".into()).into());
        };
        let timestamp = self.clock.next();
        let change = PendingChange::Insert {
            id: self.next_id(timestamp),
            timestamp,
            collection_name: collection.to_string(),
            key: key.to_string(),
            value,
        };
        mutation_log::append_change(self.overlay.inner_mut(), self.mutation_id, change).await
    }

    async fn update(&mut self, collection: &str, key: &str, delta: &json_patch::Patch) -> ClientResult<()> {
        let (event, post) = self.overlay.record_optimistic_update(collection, key, delta).await?;
        let ChangeEvent::Update { pre_update_value, .. } = event else {
            return Err(DbError::Internal("record_optimistic_update returned non-Update event".into()).into());
        };
        let timestamp = self.clock.next();
        let change = PendingChange::Update {
            id: self.next_id(timestamp),
            timestamp,
            collection_name: collection.to_string(),
            key: key.to_string(),
            pre_update_value,
            post_update_value: post,
            delta: delta.clone(),
        };
        mutation_log::append_change(self.overlay.inner_mut(), self.mutation_id, change).await
    }

    async fn delete(&mut self, collection: &str, key: &str) -> ClientResult<()> {
        let event = self.overlay.record_optimistic_delete(collection, key).await?;
        let ChangeEvent::Delete { value, .. } = event else {
            return Err(DbError::Internal("record_optimistic_delete returned non-Delete event".into()).into());
        };
        let timestamp = self.clock.next();
        let change = PendingChange::Delete {
            id: self.next_id(timestamp),
            timestamp,
            collection_name: collection.to_string(),
            key: key.to_string(),
            value,
        };
        mutation_log::append_change(self.overlay.inner_mut(), self.mutation_id, change).await
    }
}

/// Ergonomic `tx.collection("todo").insert(key, value)` surface. Each call
/// reborrows the owning `WriteTransaction`.
pub struct CollectionHandle<'a, 'b> {
    tx: &'b mut WriteTransaction<'a>,
    collection: String,
}

impl CollectionHandle<'_, '_> {
    pub async fn insert(&mut self, key: &str, value: Value) -> ClientResult<()> {
        self.tx.insert(&self.collection, key, value).await
    }

    pub async fn update(&mut self, key: &str, delta: &json_patch::Patch) -> ClientResult<()> {
        self.tx.update(&self.collection, key, delta).await
    }

    pub async fn delete(&mut self, key: &str) -> ClientResult<()> {
        self.tx.delete(&self.collection, key).await
    }

    pub async fn get(&mut self, key: &str) -> ClientResult<Option<Value>> {
        self.tx.get_by_key(&self.collection, key).await
    }

    pub async fn get_all(&mut self) -> ClientResult<Vec<Row>> {
        self.tx.get_all(&self.collection).await
    }
}
