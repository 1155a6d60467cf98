//! Wire contracts for remote integration (§6). No transport or server ships
//! here — only the traits and DTOs a concrete remote integration implements.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DbError, DbResult};

/// One authoritative change to apply to a collection during a pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CollectionOp {
    Clear,
    Created { key: String, value: Value },
    Updated { key: String, value: Value },
    Deleted { key: String },
}

/// Result of a pull: per-collection ops, the next cursor, and the highest
/// mutation id the server has processed (drives mutation-log GC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub change: HashMap<String, Vec<CollectionOp>>,
    pub cursor: Option<Value>,
    pub last_processed_mutation_id: i64,
}

/// Acknowledgement of a successfully pushed mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PushAck {
    pub server_mutation_id: i64,
}

/// Pulls authoritative changes from a remote given the last-seen cursor.
#[async_trait]
pub trait Puller: Send + Sync {
    async fn pull(&self, cursor: Option<Value>) -> DbResult<PullResponse>;
}

/// Per-`mutation_name` remote integration, registered with the sync manager.
#[async_trait]
pub trait RemoteResolver: Send + Sync {
    async fn push(&self, local_result: Value) -> DbResult<PushAck>;

    /// Default policy: retry transient remote errors up to 10 attempts.
    fn should_retry(&self, failure_count: u32, error: &DbError) -> bool {
        matches!(error, DbError::Remote(_)) && failure_count < 10
    }

    fn on_success(&self, _ack: &PushAck) {}
}
