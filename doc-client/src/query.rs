//! Reactive queries (§4.4) and the deduplicating, micro-batching engine that
//! serves their initial reads (§4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use doc_core::{hash_object, ChangeEvent, Condition, Row};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};

use crate::errors::ClientResult;
use crate::overlay::OverlayTransaction;
use crate::store::{KvStore, SqliteStore};

/// The option a `ReactiveQuery` is bound to; also the engine's cache key
/// (after canonical hashing, §4.5).
#[derive(Debug, Clone)]
pub enum QueryOption {
    Get { collection: String, key: String },
    GetAll { collection: String, filter: Option<Condition> },
}

impl QueryOption {
    fn collection(&self) -> &str {
        match self {
            Self::Get { collection, .. } | Self::GetAll { collection, .. } => collection,
        }
    }

    /// Canonical hash used as the query cache key.
    fn cache_key(&self) -> String {
        hash_object(&self.to_json())
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Get { collection, key } => {
                serde_json::json!({"op": "get", "collection": collection, "key": key})
            }
            Self::GetAll { collection, filter } => serde_json::json!({
                "op": "get_all",
                "collection": collection,
                "filter": filter.as_ref().map(|c| serde_json::json!({
                    "field": c.field, "comparator": c.comparator, "value": c.value,
                })),
            }),
        }
    }
}

/// One entry in the incremental delta published alongside a watch stream.
#[derive(Debug, Clone)]
pub enum QueryResultChange {
    Insert { key: String, value: Value },
    Update { key: String, value: Value },
    Delete { key: String },
}

#[derive(Debug, Clone, PartialEq)]
enum QueryState {
    Idle,
    Reading,
    Success,
}

/// A live, cached view of one `QueryOption`, incrementally maintained from
/// CDC events (§4.4). CDC received while `Reading` is buffered and drained
/// once the initial read resolves.
pub struct ReactiveQuery {
    option: QueryOption,
    state: RwLock<QueryState>,
    data: RwLock<HashMap<String, Value>>,
    buffered: Mutex<Vec<ChangeEvent>>,
    sender: broadcast::Sender<Vec<QueryResultChange>>,
}

impl ReactiveQuery {
    fn new(option: QueryOption) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            option,
            state: RwLock::new(QueryState::Idle),
            data: RwLock::new(HashMap::new()),
            buffered: Mutex::new(Vec::new()),
            sender,
        }
    }

    pub fn option(&self) -> &QueryOption {
        &self.option
    }

    /// Stream of incremental `QueryResultChange` batches (`.watch()`, §6).
    pub fn watch(&self) -> broadcast::Receiver<Vec<QueryResultChange>> {
        self.sender.subscribe()
    }

    /// Current full snapshot (`{key -> value}`), for `.execute()`/`.subscribe()`.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.data.read().await.clone()
    }

    async fn resolve_initial(&self, rows: Vec<Row>) {
        {
            let mut data = self.data.write().await;
            for row in rows {
                data.insert(row.key, row.value);
            }
        }
        *self.state.write().await = QueryState::Success;

        let buffered: Vec<ChangeEvent> = std::mem::take(&mut *self.buffered.lock().await);
        for event in buffered {
            self.apply(&event).await;
        }
    }

    /// Affect predicate (§4.4).
    fn affects(&self, event: &ChangeEvent) -> bool {
        if event.collection() != self.option.collection() {
            return false;
        }
        match event {
            ChangeEvent::Clear { .. } => true,
            _ => match &self.option {
                QueryOption::Get { key, .. } => event.key() == Some(key.as_str()),
                QueryOption::GetAll { filter: None, .. } => true,
                QueryOption::GetAll { filter: Some(condition), .. } => match event {
                    ChangeEvent::Insert { value, .. } | ChangeEvent::Delete { value, .. } => {
                        condition.satisfies(value)
                    }
                    ChangeEvent::Update { post_update_value, .. } => condition.satisfies(post_update_value),
                    ChangeEvent::Clear { .. } => true,
                },
            },
        }
    }

    async fn apply(&self, event: &ChangeEvent) {
        if !self.affects(event) {
            return;
        }

        if *self.state.read().await != QueryState::Success {
            self.buffered.lock().await.push(event.clone());
            return;
        }

        let changes = {
            let mut data = self.data.write().await;
            match event {
                ChangeEvent::Clear { .. } => {
                    let changes: Vec<QueryResultChange> =
                        data.keys().cloned().map(|key| QueryResultChange::Delete { key }).collect();
                    data.clear();
                    changes
                }
                ChangeEvent::Insert { key, value, .. } => {
                    data.insert(key.clone(), value.clone());
                    vec![QueryResultChange::Insert { key: key.clone(), value: value.clone() }]
                }
                ChangeEvent::Delete { key, .. } => {
                    if data.remove(key).is_some() {
                        vec![QueryResultChange::Delete { key: key.clone() }]
                    } else {
                        vec![]
                    }
                }
                ChangeEvent::Update { key, post_update_value, .. } => {
                    data.insert(key.clone(), post_update_value.clone());
                    vec![QueryResultChange::Update { key: key.clone(), value: post_update_value.clone() }]
                }
            }
        };

        if !changes.is_empty() {
            let _ = self.sender.send(changes);
        }
    }
}

enum PendingRead {
    Get { collection: String, key: String, resolve: oneshot::Sender<ClientResult<Option<Value>>> },
    GetAll { collection: String, filter: Option<Condition>, resolve: oneshot::Sender<ClientResult<Vec<Row>>> },
}

struct BatchState {
    pending: Vec<PendingRead>,
    timer_armed: bool,
}

/// Deduplicating query cache plus the 5ms micro-batch read scheduler (§4.5).
///
/// Always held behind an `Arc` (the facade's `Database::query_engine`); the
/// `self: &Arc<Self>` receivers below spawn the batch-drain timer against a
/// cloned `Arc`, so the engine outlives its own timer without unsafe aliasing.
pub struct QueryEngine {
    store: Arc<SqliteStore>,
    cache: DashMap<String, Arc<ReactiveQuery>>,
    batch: Mutex<BatchState>,
    batch_window: Duration,
}

impl QueryEngine {
    pub fn new(store: Arc<SqliteStore>, batch_window: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            batch: Mutex::new(BatchState { pending: Vec::new(), timer_armed: false }),
            batch_window,
        }
    }

    /// Looks up or creates the cached `ReactiveQuery` for this option and
    /// awaits its batched initial read (S5: concurrent identical queries
    /// within the batch window share one KV read).
    pub async fn query(self: &Arc<Self>, option: QueryOption) -> Arc<ReactiveQuery> {
        let key = option.cache_key();
        // `entry()` holds the shard lock across the occupied/vacant check, so
        // two callers racing for a brand-new key can't both observe a miss
        // and each schedule their own read (S5).
        let query = match self.cache.entry(key) {
            Entry::Occupied(entry) => return entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(Arc::new(ReactiveQuery::new(option.clone()))).clone(),
        };
        *query.state.write().await = QueryState::Reading;

        match option {
            QueryOption::Get { collection, key } => {
                let value = self.schedule_get(collection, key.clone()).await.ok().flatten();
                let rows = value.into_iter().map(|value| Row { key: key.clone(), value }).collect();
                query.resolve_initial(rows).await;
            }
            QueryOption::GetAll { collection, filter } => {
                let rows = self.schedule_get_all(collection, filter).await.unwrap_or_default();
                query.resolve_initial(rows).await;
            }
        }
        query
    }

    async fn schedule_get(self: &Arc<Self>, collection: String, key: String) -> ClientResult<Option<Value>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(PendingRead::Get { collection, key, resolve: tx }).await;
        rx.await.unwrap_or(Ok(None))
    }

    async fn schedule_get_all(self: &Arc<Self>, collection: String, filter: Option<Condition>) -> ClientResult<Vec<Row>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(PendingRead::GetAll { collection, filter, resolve: tx }).await;
        rx.await.unwrap_or(Ok(Vec::new()))
    }

    async fn enqueue(self: &Arc<Self>, read: PendingRead) {
        let mut batch = self.batch.lock().await;
        batch.pending.push(read);
        if !batch.timer_armed {
            batch.timer_armed = true;
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(engine.batch_window).await;
                let _ = engine.drain_batch().await;
            });
        }
    }

    /// Drains every queued read through one read-only overlay tx.
    async fn drain_batch(&self) -> ClientResult<()> {
        let pending = {
            let mut batch = self.batch.lock().await;
            batch.timer_armed = false;
            std::mem::take(&mut batch.pending)
        };
        if pending.is_empty() {
            return Ok(());
        }

        let tx = self.store.begin().await?;
        let mut overlay = OverlayTransaction::new(tx);
        for read in pending {
            match read {
                PendingRead::Get { collection, key, resolve } => {
                    let result = overlay.get_by_key(&collection, &key).await;
                    let _ = resolve.send(result);
                }
                PendingRead::GetAll { collection, filter, resolve } => {
                    let result = match &filter {
                        Some(condition) => overlay.get_by_condition(&collection, condition).await,
                        None => overlay.get_all(&collection).await,
                    };
                    let _ = resolve.send(result);
                }
            }
        }
        overlay.rollback().await
    }

    /// Fans a commit's buffered CDC events out to every affected cached query.
    pub async fn dispatch(&self, events: &[ChangeEvent]) {
        for entry in self.cache.iter() {
            let query = entry.value().clone();
            for event in events {
                query.apply(event).await;
            }
        }
    }
}
