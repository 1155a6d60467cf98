//! Local-first document store built on an optimistic overlay over a
//! SQLite-backed KV adapter (`doc-core` for the storage-independent types;
//! this crate for the concrete engine: overlay, mutation log, reactive
//! queries, sync, and the `Database` facade that wires them together).

mod broadcaster;
mod config;
mod db;
mod errors;
mod lock;
mod mutation_log;
mod overlay;
mod query;
mod store;
mod sync;
mod write_transaction;

pub use broadcaster::{Broadcaster, LocalBroadcaster};
pub use config::DatabaseConfig;
pub use db::{CollectionQuery, Database};
pub use errors::{ClientError, ClientResult};
pub use lock::{LockController, LockStore, MetaLockStore};
pub use overlay::OverlayTransaction;
pub use query::{QueryEngine, QueryOption, QueryResultChange, ReactiveQuery};
pub use store::{KvStore, KvTransaction, SqliteStore, SqliteTransaction};
pub use sync::SyncManager;
pub use write_transaction::{CollectionHandle, WriteTransaction};

pub use doc_core::{
    is_reserved_collection, CollectionMeta, ChangeEvent, CollectionOp, Comparator, Condition,
    DbError, DbResult, IndexMeta, MonotonicClock, PullResponse, Puller, PushAck, RemoteResolver,
    Row, META_COLLECTION, MUTATIONS_COLLECTION,
};
