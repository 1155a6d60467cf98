//! The overlay transaction (§4.3) — the heart of the engine. Wraps the raw
//! SQLite transaction so every read reflects base-store state merged with
//! the pending-mutation log, and every authoritative write derives the CDC
//! correction needed to keep subscribers' views consistent.

use std::collections::HashMap;

use doc_core::{
    fold_changes, patches, ChangeEvent, Condition, DbError, Mutation, PendingChange,
    PendingDocumentState, PendingMap, Row,
};
use serde_json::Value;

use crate::errors::ClientResult;
use crate::mutation_log;
use crate::store::{KvTransaction, SqliteTransaction};

pub struct OverlayTransaction {
    inner: SqliteTransaction,
    pending: Option<PendingMap>,
    events: Vec<ChangeEvent>,
}

/// The value a subscriber currently sees for a key, given the base row and
/// whatever pending state shadows it. `None` means "no document".
fn visible_value(base: Option<&Value>, state: Option<&PendingDocumentState>) -> ClientResult<Option<Value>> {
    Ok(match state {
        None => base.cloned(),
        Some(PendingDocumentState::Deleted { .. }) => None,
        Some(PendingDocumentState::Inserted { value }) => Some(value.clone()),
        Some(PendingDocumentState::UpdatePostInsert { post_update_value, .. }) => {
            Some(post_update_value.clone())
        }
        Some(PendingDocumentState::Updated { delta, .. }) => match base {
            Some(b) => Some(patches::apply(b, delta)?),
            None => None,
        },
    })
}

/// The minimal CDC event describing a transition in observable state, or
/// `None` if nothing changed (invariant 1, §8).
fn diff_to_event(collection: &str, key: &str, before: Option<Value>, after: Option<Value>) -> Option<ChangeEvent> {
    match (before, after) {
        (None, Some(value)) => Some(ChangeEvent::Insert { collection: collection.into(), key: key.into(), value }),
        (Some(value), None) => Some(ChangeEvent::Delete { collection: collection.into(), key: key.into(), value }),
        (Some(pre_update_value), Some(post_update_value)) if pre_update_value != post_update_value => {
            Some(ChangeEvent::Update {
                collection: collection.into(),
                key: key.into(),
                delta: patches::diff(&pre_update_value, &post_update_value),
                pre_update_value,
                post_update_value,
            })
        }
        _ => None,
    }
}

impl OverlayTransaction {
    pub fn new(inner: SqliteTransaction) -> Self {
        Self { inner, pending: None, events: Vec::new() }
    }

    async fn pending_map(&mut self) -> ClientResult<&PendingMap> {
        if self.pending.is_none() {
            let mutations = mutation_log::completed_mutations(&mut self.inner).await?;
            let changes: Vec<&PendingChange> = mutations.iter().flat_map(|m| m.changes.iter()).collect();
            self.pending = Some(fold_changes(changes));
        }
        Ok(self.pending.as_ref().unwrap())
    }

    fn state_for<'a>(map: &'a PendingMap, collection: &str, key: &str) -> Option<&'a PendingDocumentState> {
        map.get(collection).and_then(|m| m.get(key))
    }

    pub fn inner_mut(&mut self) -> &mut SqliteTransaction {
        &mut self.inner
    }

    // ---- reads (§4.3.2) ----

    pub async fn get_by_key(&mut self, collection: &str, key: &str) -> ClientResult<Option<Value>> {
        let base = self.inner.get_by_key(collection, key).await?;
        let map = self.pending_map().await?;
        Ok(visible_value(base.as_ref(), Self::state_for(map, collection, key))?)
    }

    pub async fn get_all(&mut self, collection: &str) -> ClientResult<Vec<Row>> {
        let base_rows = self.inner.get_all(collection).await?;
        let mut result: HashMap<String, Value> =
            base_rows.into_iter().map(|r| (r.key, r.value)).collect();

        let map = self.pending_map().await?.clone();
        if let Some(by_key) = map.get(collection) {
            for (key, state) in by_key {
                match visible_value(result.get(key), Some(state))? {
                    Some(value) => {
                        result.insert(key.clone(), value);
                    }
                    None => {
                        result.remove(key);
                    }
                }
            }
        }

        Ok(result.into_iter().map(|(key, value)| Row { key, value }).collect())
    }

    pub async fn get_by_condition(&mut self, collection: &str, condition: &Condition) -> ClientResult<Vec<Row>> {
        let base_rows = self.inner.get_by_condition(collection, condition).await?;
        let mut result: HashMap<String, Value> =
            base_rows.into_iter().map(|r| (r.key, r.value)).collect();

        let map = self.pending_map().await?.clone();
        if let Some(by_key) = map.get(collection) {
            for (key, state) in by_key {
                let base_for_key = match result.get(key) {
                    Some(v) => Some(v.clone()),
                    None => self.inner.get_by_key(collection, key).await?,
                };
                match visible_value(base_for_key.as_ref(), Some(state))? {
                    Some(value) if condition.satisfies(&value) => {
                        result.insert(key.clone(), value);
                    }
                    _ => {
                        result.remove(key);
                    }
                }
            }
        }

        Ok(result.into_iter().map(|(key, value)| Row { key, value }).collect())
    }

    // ---- optimistic writes (§4.6): derive CDC only, never touch the raw store ----

    /// Validates an optimistic insert, buffers its CDC event (fired on
    /// commit), and returns the event so the caller can also append a
    /// `PendingChange` to the current mutation row.
    pub async fn record_optimistic_insert(&mut self, collection: &str, key: &str, value: Value) -> ClientResult<ChangeEvent> {
        let map = self.pending_map().await?;
        match Self::state_for(map, collection, key) {
            None => {
                if self.inner.get_by_key(collection, key).await?.is_some() {
                    return Err(DbError::DuplicateKey { collection: collection.into(), key: key.into() }.into());
                }
            }
            Some(PendingDocumentState::Deleted { .. }) => {}
            Some(_) => {
                return Err(DbError::DuplicateKey { collection: collection.into(), key: key.into() }.into());
            }
        }
        let event = ChangeEvent::Insert { collection: collection.into(), key: key.into(), value };
        self.events.push(event.clone());
        Ok(event)
    }

    /// Validates an optimistic update, buffers its CDC event, and returns the
    /// event plus the merged post-value the caller stores on the mutation row.
    pub async fn record_optimistic_update(
        &mut self,
        collection: &str,
        key: &str,
        delta: &json_patch::Patch,
    ) -> ClientResult<(ChangeEvent, Value)> {
        let current = self
            .get_by_key(collection, key)
            .await?
            .ok_or_else(|| DbError::KeyNotFound { collection: collection.into(), key: key.into() })?;
        let post = patches::apply(&current, delta)?;
        let event = ChangeEvent::Update {
            collection: collection.into(),
            key: key.into(),
            pre_update_value: current,
            delta: delta.clone(),
            post_update_value: post.clone(),
        };
        self.events.push(event.clone());
        Ok((event, post))
    }

    pub async fn record_optimistic_delete(&mut self, collection: &str, key: &str) -> ClientResult<ChangeEvent> {
        let current = self
            .get_by_key(collection, key)
            .await?
            .ok_or_else(|| DbError::KeyNotFound { collection: collection.into(), key: key.into() })?;
        let event = ChangeEvent::Delete { collection: collection.into(), key: key.into(), value: current };
        self.events.push(event.clone());
        Ok(event)
    }

    // ---- authoritative writes (§4.3.3), used by pull and by GC-restore ----

    pub async fn apply_authoritative_insert(&mut self, collection: &str, key: &str, value: Value) -> ClientResult<()> {
        let before = self.get_by_key(collection, key).await?;
        self.inner.upsert(collection, key, value).await?;
        self.pending = None;
        let after = self.get_by_key(collection, key).await?;
        if let Some(event) = diff_to_event(collection, key, before, after) {
            self.events.push(event);
        }
        Ok(())
    }

    pub async fn apply_authoritative_update(&mut self, collection: &str, key: &str, delta: &json_patch::Patch) -> ClientResult<()> {
        let before = self.get_by_key(collection, key).await?;
        let raw_base = self.inner.get_by_key(collection, key).await?.unwrap_or(Value::Null);
        let new_base = patches::apply(&raw_base, delta)?;
        self.inner.upsert(collection, key, new_base).await?;
        self.pending = None;
        let after = self.get_by_key(collection, key).await?;
        if let Some(event) = diff_to_event(collection, key, before, after) {
            self.events.push(event);
        }
        Ok(())
    }

    pub async fn apply_authoritative_delete(&mut self, collection: &str, key: &str) -> ClientResult<()> {
        let before = self.get_by_key(collection, key).await?;
        if self.inner.get_by_key(collection, key).await?.is_some() {
            self.inner.delete(collection, key).await?;
        }
        self.pending = None;
        let after = self.get_by_key(collection, key).await?;
        if let Some(event) = diff_to_event(collection, key, before, after) {
            self.events.push(event);
        }
        Ok(())
    }

    pub async fn apply_authoritative_clear(&mut self, collection: &str) -> ClientResult<()> {
        self.inner.clear(collection).await?;
        self.events.push(ChangeEvent::Clear { collection: collection.to_string() });
        Ok(())
    }

    // ---- mutation-log GC (§4.3.4) ----

    /// Deletes a completed mutation row and emits the CDC needed to keep the
    /// observable state continuous now that its overlay shadow is gone.
    pub async fn gc_mutation(&mut self, mutation_id: i64) -> ClientResult<()> {
        let mutation = mutation_log::delete_mutation(&mut self.inner, mutation_id).await?;
        self.restore_cdc_for(&mutation).await
    }

    /// Same restoring-CDC derivation as `gc_mutation`, but for a mutation row
    /// that has *already* been deleted (e.g. `mutation_log::delete_acknowledged`'s
    /// bulk delete). Skips the now-redundant re-delete-by-id, which would
    /// otherwise fail with `MutationRowMissing` against a row that's already gone.
    pub async fn gc_already_deleted_mutation(&mut self, mutation: Mutation) -> ClientResult<()> {
        self.restore_cdc_for(&mutation).await
    }

    async fn restore_cdc_for(&mut self, mutation: &Mutation) -> ClientResult<()> {
        self.pending = None;

        for change in &mutation.changes {
            match change {
                PendingChange::Delete { collection_name, key, .. } => {
                    let base = self.inner.get_by_key(collection_name, key).await?;
                    let map = self.pending_map().await?;
                    let still_shadowed = Self::state_for(map, collection_name, key).is_some();
                    if !still_shadowed {
                        if let Some(value) = base {
                            self.events.push(ChangeEvent::Insert {
                                collection: collection_name.clone(),
                                key: key.clone(),
                                value,
                            });
                        }
                    }
                }
                PendingChange::Insert { collection_name, key, value, .. } => {
                    let base = self.inner.get_by_key(collection_name, key).await?;
                    if base.is_none() {
                        self.events.push(ChangeEvent::Delete {
                            collection: collection_name.clone(),
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                }
                PendingChange::Update { collection_name, key, delta, .. } => {
                    let base = self.inner.get_by_key(collection_name, key).await?;
                    if let Some(base_value) = base {
                        let restore = patches::shadow_restoring_patch(delta, &base_value);
                        if !patches::is_empty(&restore) {
                            let pre = patches::apply(&base_value, delta).unwrap_or_else(|_| base_value.clone());
                            self.events.push(ChangeEvent::Update {
                                collection: collection_name.clone(),
                                key: key.clone(),
                                pre_update_value: pre,
                                delta: restore,
                                post_update_value: base_value,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ---- commit / rollback (§4.3.5) ----

    pub async fn commit(self) -> ClientResult<Vec<ChangeEvent>> {
        self.inner.commit().await?;
        Ok(self.events)
    }

    pub async fn rollback(self) -> ClientResult<()> {
        self.inner.rollback().await?;
        Ok(())
    }
}
