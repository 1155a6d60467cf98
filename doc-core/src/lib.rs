//! Shared, storage-independent types for the optimistic overlay document
//! store: conditions, the mutation log and its overlay-folding FSM, CDC wire
//! shapes, patch helpers, and the remote protocol contracts.

pub mod cdc;
pub mod condition;
pub mod errors;
pub mod models;
pub mod mutation;
pub mod patches;
pub mod protocol;
pub mod util;

pub use cdc::ChangeEvent;
pub use condition::{cmp_values, Comparator, Condition, RangeDescriptor};
pub use errors::{DbError, DbResult};
pub use models::{is_reserved_collection, CollectionMeta, IndexMeta, Row, META_COLLECTION, MUTATIONS_COLLECTION};
pub use mutation::{fold_change, fold_changes, Mutation, PendingChange, PendingDocumentState, PendingMap};
pub use protocol::{CollectionOp, PullResponse, Puller, PushAck, RemoteResolver};
pub use util::{canonicalize, hash_object, MonotonicClock};
