//! Change-data-capture event shapes emitted by the overlay (§4.3.3) and
//! consumed by reactive queries (§4.4) and CDC subscribers (§6).

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChangeEvent {
    Insert {
        collection: String,
        key: String,
        value: Value,
    },
    Update {
        collection: String,
        key: String,
        pre_update_value: Value,
        delta: Patch,
        post_update_value: Value,
    },
    Delete {
        collection: String,
        key: String,
        value: Value,
    },
    Clear {
        collection: String,
    },
}

impl ChangeEvent {
    pub fn collection(&self) -> &str {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. }
            | Self::Clear { collection } => collection,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Delete { key, .. } => {
                Some(key)
            }
            Self::Clear { .. } => None,
        }
    }
}
