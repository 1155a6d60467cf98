use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved collection holding mutation rows; never exposed to user subscribers.
pub const MUTATIONS_COLLECTION: &str = "__mutations";
/// Reserved collection holding the pull cursor and advisory lock state.
pub const META_COLLECTION: &str = "__meta";

pub fn is_reserved_collection(name: &str) -> bool {
    name == MUTATIONS_COLLECTION || name == META_COLLECTION
}

/// Declares a secondary index over a top-level scalar field of `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub field: String,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexMeta {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into(), unique: false, multi_entry: false }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

/// Metadata for one user-defined collection (table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub indexes: Vec<IndexMeta>,
}

impl CollectionMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), indexes: Vec::new() }
    }

    pub fn with_index(mut self, index: IndexMeta) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index_for(&self, field: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|idx| idx.field == field)
    }
}

/// A physical `{key, value}` row as stored by the KV adapter. The primary key
/// is carried independently of `value` so lookups never need to parse JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub value: Value,
}
