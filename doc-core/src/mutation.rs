//! Mutation log rows and the pure overlay-folding FSM (§3, §4.3.1).
//!
//! Kept independent of any storage adapter: `fold_change`/`fold_changes` take
//! and return in-memory maps so the overlay transaction (in `doc-client`) can
//! drive them against whatever `__mutations` rows the KV adapter returns.

use std::collections::HashMap;

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::patches;

/// One change recorded by a `WriteTransaction` against a single document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PendingChange {
    Insert {
        id: String,
        timestamp: i64,
        collection_name: String,
        key: String,
        value: Value,
    },
    Update {
        id: String,
        timestamp: i64,
        collection_name: String,
        key: String,
        pre_update_value: Value,
        post_update_value: Value,
        delta: Patch,
    },
    Delete {
        id: String,
        timestamp: i64,
        collection_name: String,
        key: String,
        value: Value,
    },
}

impl PendingChange {
    pub fn collection_name(&self) -> &str {
        match self {
            Self::Insert { collection_name, .. }
            | Self::Update { collection_name, .. }
            | Self::Delete { collection_name, .. } => collection_name,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Insert { timestamp, .. }
            | Self::Update { timestamp, .. }
            | Self::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

/// A mutation-log row (`__mutations`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    pub id: i64,
    pub mutation_name: String,
    pub mutation_args: Value,
    pub changes: Vec<PendingChange>,
    pub collections_affected: Vec<String>,
    pub is_completed: bool,
    pub is_pushed: bool,
    pub remote_push_attempts: u32,
    pub local_resolver_result: Option<Value>,
    pub server_mutation_id: Option<i64>,
}

impl Mutation {
    pub fn new(id: i64, mutation_name: impl Into<String>, mutation_args: Value) -> Self {
        Self {
            id,
            mutation_name: mutation_name.into(),
            mutation_args,
            changes: Vec::new(),
            collections_affected: Vec::new(),
            is_completed: false,
            is_pushed: false,
            remote_push_attempts: 0,
            local_resolver_result: None,
            server_mutation_id: None,
        }
    }

    pub fn record(&mut self, change: PendingChange) {
        let collection = change.collection_name().to_string();
        if !self.collections_affected.contains(&collection) {
            self.collections_affected.push(collection);
        }
        self.changes.push(change);
    }
}

/// The overlay's per-document view folded out of the pending-mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingDocumentState {
    Inserted { value: Value },
    Updated { delta: Patch, post_update_value: Value },
    UpdatePostInsert { delta: Patch, post_update_value: Value },
    Deleted { value: Value },
}

impl PendingDocumentState {
    /// The value a reader sees for this key, if any (Deleted has none).
    pub fn visible_value(&self) -> Option<&Value> {
        match self {
            Self::Inserted { value } | Self::Deleted { value } => Some(value),
            Self::Updated { post_update_value, .. }
            | Self::UpdatePostInsert { post_update_value, .. } => Some(post_update_value),
        }
    }
}

pub type PendingMap = HashMap<String, HashMap<String, PendingDocumentState>>;

/// Folds one change into the pending-state map per the overlay FSM (§4.3.1).
///
/// Changes must be supplied in `(mutation_id, timestamp)` order across the
/// whole log; this function only applies the per-key transition, it does not
/// sort.
pub fn fold_change(map: &mut PendingMap, change: &PendingChange) {
    let collection = map.entry(change.collection_name().to_string()).or_default();
    let prior = collection.remove(change.key());

    let next = match (prior, change) {
        (None, PendingChange::Insert { value, .. }) => {
            PendingDocumentState::Inserted { value: value.clone() }
        }
        (None, PendingChange::Update { delta, post_update_value, .. }) => {
            PendingDocumentState::Updated {
                delta: delta.clone(),
                post_update_value: post_update_value.clone(),
            }
        }
        (None, PendingChange::Delete { value, .. }) => {
            PendingDocumentState::Deleted { value: value.clone() }
        }

        (Some(PendingDocumentState::Inserted { value }), PendingChange::Update { delta, .. }) => {
            let merged = patches::apply(&value, delta).unwrap_or(value);
            PendingDocumentState::UpdatePostInsert { delta: delta.clone(), post_update_value: merged }
        }
        (Some(PendingDocumentState::Inserted { value }), PendingChange::Delete { .. }) => {
            PendingDocumentState::Deleted { value }
        }
        (Some(PendingDocumentState::Inserted { value }), PendingChange::Insert { .. }) => {
            tracing::warn!(
                collection = %change.collection_name(),
                key = %change.key(),
                "fold encountered Insert over already-pending Inserted; keeping later change"
            );
            match change {
                PendingChange::Insert { value: new_value, .. } => {
                    PendingDocumentState::Inserted { value: new_value.clone() }
                }
                _ => unreachable!(),
            }
        }

        (
            Some(PendingDocumentState::Updated { delta: prior_delta, post_update_value }),
            PendingChange::Update { delta, .. },
        ) => {
            let merged_delta = patches::merge_patches(&prior_delta, delta);
            let merged_value = patches::apply(&post_update_value, delta).unwrap_or(post_update_value);
            PendingDocumentState::Updated { delta: merged_delta, post_update_value: merged_value }
        }
        (Some(PendingDocumentState::Updated { post_update_value, .. }), PendingChange::Delete { .. }) => {
            PendingDocumentState::Deleted { value: post_update_value }
        }
        (Some(PendingDocumentState::Updated { .. }), PendingChange::Insert { value, .. }) => {
            tracing::warn!(
                collection = %change.collection_name(),
                key = %change.key(),
                "fold encountered Insert over already-pending Updated; keeping later change"
            );
            PendingDocumentState::Inserted { value: value.clone() }
        }

        (
            Some(PendingDocumentState::UpdatePostInsert { delta: prior_delta, post_update_value }),
            PendingChange::Update { delta, .. },
        ) => {
            let merged_delta = patches::merge_patches(&prior_delta, delta);
            let merged_value = patches::apply(&post_update_value, delta).unwrap_or(post_update_value);
            PendingDocumentState::UpdatePostInsert {
                delta: merged_delta,
                post_update_value: merged_value,
            }
        }
        (
            Some(PendingDocumentState::UpdatePostInsert { post_update_value, .. }),
            PendingChange::Delete { .. },
        ) => PendingDocumentState::Deleted { value: post_update_value },
        (Some(PendingDocumentState::UpdatePostInsert { .. }), PendingChange::Insert { value, .. }) => {
            tracing::warn!(
                collection = %change.collection_name(),
                key = %change.key(),
                "fold encountered Insert over already-pending UpdatePostInsert; keeping later change"
            );
            PendingDocumentState::Inserted { value: value.clone() }
        }

        (Some(PendingDocumentState::Deleted { .. }), PendingChange::Insert { value, .. }) => {
            PendingDocumentState::Inserted { value: value.clone() }
        }
        (Some(state @ PendingDocumentState::Deleted { .. }), PendingChange::Update { .. }) => {
            tracing::warn!(
                collection = %change.collection_name(),
                key = %change.key(),
                "ignoring Update folded over a pending Deleted document"
            );
            state
        }
        (Some(state @ PendingDocumentState::Deleted { .. }), PendingChange::Delete { .. }) => state,
    };

    collection.insert(change.key().to_string(), next);
}

/// Sorts a flattened change list by `(mutation_id, timestamp)` and folds it
/// into a fresh pending map. `mutation_id` is parsed out of `change.id`,
/// which is always formatted `"<mutation_id>-<timestamp>"`.
pub fn fold_changes<'a>(changes: impl IntoIterator<Item = &'a PendingChange>) -> PendingMap {
    let mut ordered: Vec<&PendingChange> = changes.into_iter().collect();
    ordered.sort_by_key(|c| (mutation_id_of(c.id()), c.timestamp()));

    let mut map = PendingMap::new();
    for change in ordered {
        fold_change(&mut map, change);
    }
    map
}

fn mutation_id_of(change_id: &str) -> i64 {
    change_id
        .split_once('-')
        .and_then(|(mutation_id, _)| mutation_id.parse().ok())
        .unwrap_or(i64::MAX)
}
