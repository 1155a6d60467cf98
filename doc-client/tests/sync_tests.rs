mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doc_client::{ChangeEvent, CollectionOp, DbError, DbResult, KvTransaction, PushAck, RemoteResolver, META_COLLECTION};
use serde_json::json;

use common::test_database_with;

struct AlwaysFails;

#[async_trait]
impl RemoteResolver for AlwaysFails {
    async fn push(&self, _local_result: serde_json::Value) -> DbResult<PushAck> {
        Err(DbError::Remote("simulated permanent failure".into()))
    }

    fn should_retry(&self, _failure_count: u32, _error: &DbError) -> bool {
        false
    }
}

struct AlwaysSucceeds;

#[async_trait]
impl RemoteResolver for AlwaysSucceeds {
    async fn push(&self, _local_result: serde_json::Value) -> DbResult<PushAck> {
        Ok(PushAck { server_mutation_id: 1 })
    }
}

/// S3 — a push that fails permanently reverts the optimistic insert, observed
/// as an Insert (the mutation's own commit) followed by a Delete (the GC revert).
#[tokio::test]
async fn permanent_push_failure_reverts_optimistic_insert() {
    let mut resolvers: HashMap<String, Arc<dyn RemoteResolver>> = HashMap::new();
    resolvers.insert("create_todo".to_string(), Arc::new(AlwaysFails));
    let db = test_database_with(None, resolvers).await;

    let mut cdc = db.subscribe_to_cdc();

    db.mutate("create_todo", json!({"key": "k1"}), |tx| async move {
        tx.collection("todo").insert("k1", json!({"title": "a"})).await
    })
    .await
    .unwrap();

    let insert_event = tokio::time::timeout(Duration::from_millis(500), cdc.recv()).await.unwrap().unwrap();
    assert!(matches!(insert_event, ChangeEvent::Insert { .. }));

    let revert_event = tokio::time::timeout(Duration::from_millis(2000), cdc.recv()).await.unwrap().unwrap();
    match revert_event {
        ChangeEvent::Delete { collection, key, value } => {
            assert_eq!(collection, "todo");
            assert_eq!(key, "k1");
            assert_eq!(value, json!({"title": "a"}));
        }
        other => panic!("expected the permanent failure to revert via Delete, got {other:?}"),
    }

    assert_eq!(db.pending_mutation_count().await.unwrap(), 0);
    let visible = db
        .batch_read(|overlay| async move { overlay.get_by_key("todo", "k1").await })
        .await
        .unwrap();
    assert_eq!(visible, None);
}

/// A mutation whose name has no registered remote resolver is reverted
/// locally the same way a permanent push failure would be.
#[tokio::test]
async fn mutation_with_no_registered_resolver_is_reverted() {
    let db = test_database_with(None, HashMap::new()).await;
    let mut cdc = db.subscribe_to_cdc();

    db.mutate("create_todo", json!({"key": "k1"}), |tx| async move {
        tx.collection("todo").insert("k1", json!({"title": "a"})).await
    })
    .await
    .unwrap();

    let insert_event = tokio::time::timeout(Duration::from_millis(500), cdc.recv()).await.unwrap().unwrap();
    assert!(matches!(insert_event, ChangeEvent::Insert { .. }));

    let revert_event = tokio::time::timeout(Duration::from_millis(2000), cdc.recv()).await.unwrap().unwrap();
    assert!(matches!(revert_event, ChangeEvent::Delete { .. }));
    assert_eq!(db.pending_mutation_count().await.unwrap(), 0);
}

/// S4 — a pull response carrying a `Clear` op empties the collection and
/// advances the stored cursor.
#[tokio::test]
async fn pull_response_clear_empties_collection_and_advances_cursor() {
    let db = test_database_with(None, HashMap::new()).await;

    let mut seed = HashMap::new();
    seed.insert(
        "todo".to_string(),
        vec![CollectionOp::Created { key: "k1".into(), value: json!({"title": "a"}) }],
    );
    db.apply_change(doc_client::PullResponse { change: seed, cursor: Some(json!("c1")), last_processed_mutation_id: 0 })
        .await
        .unwrap();

    let before_clear = db
        .batch_read(|overlay| async move { overlay.get_all("todo").await })
        .await
        .unwrap();
    assert_eq!(before_clear.len(), 1);

    let mut cdc = db.subscribe_to_cdc();

    let mut clear = HashMap::new();
    clear.insert("todo".to_string(), vec![CollectionOp::Clear]);
    db.apply_change(doc_client::PullResponse { change: clear, cursor: Some(json!("c2")), last_processed_mutation_id: 5 })
        .await
        .unwrap();

    let clear_event = tokio::time::timeout(Duration::from_millis(500), cdc.recv()).await.unwrap().unwrap();
    assert!(matches!(clear_event, ChangeEvent::Clear { collection } if collection == "todo"));

    let after_clear = db
        .batch_read(|overlay| async move { overlay.get_all("todo").await })
        .await
        .unwrap();
    assert!(after_clear.is_empty());

    let cursor = db
        .batch_read(|overlay| async move { overlay.inner_mut().get_by_key(META_COLLECTION, "cursor").await.map_err(Into::into) })
        .await
        .unwrap();
    assert_eq!(cursor, Some(json!("c2")));
}

/// S4 continued — acknowledging a mutation that was already pushed (and thus
/// already bulk-deleted from `__mutations` by `delete_acknowledged`) must not
/// fail trying to GC it a second time by id.
#[tokio::test]
async fn apply_change_gcs_an_already_acknowledged_pushed_mutation() {
    let mut resolvers: HashMap<String, Arc<dyn RemoteResolver>> = HashMap::new();
    resolvers.insert("create_todo".to_string(), Arc::new(AlwaysSucceeds));
    let db = test_database_with(None, resolvers).await;

    db.mutate("create_todo", json!({"key": "k1"}), |tx| async move {
        tx.collection("todo").insert("k1", json!({"title": "a"})).await
    })
    .await
    .unwrap();

    // Wait for the background push to succeed and mark the mutation pushed
    // (`pending_mutation_count` only counts not-yet-pushed rows).
    for _ in 0..100 {
        if db.pending_mutation_count().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(db.pending_mutation_count().await.unwrap(), 0, "push should have completed and marked the mutation pushed");

    // The server acknowledges mutation #1 (its pushed `server_mutation_id`)
    // and echoes the same row back authoritatively.
    let mut change = HashMap::new();
    change.insert(
        "todo".to_string(),
        vec![CollectionOp::Created { key: "k1".into(), value: json!({"title": "a"}) }],
    );
    db.apply_change(doc_client::PullResponse { change, cursor: Some(json!("c1")), last_processed_mutation_id: 1 })
        .await
        .expect("apply_change must not fail GC-ing an already-deleted, acknowledged mutation row");

    let visible = db
        .batch_read(|overlay| async move { overlay.get_by_key("todo", "k1").await })
        .await
        .unwrap();
    assert_eq!(visible, Some(json!({"title": "a"})));
}

/// `Database::pull()` drives its registered `Puller` and applies the response
/// the same way a sideband `apply_change` would.
#[tokio::test]
async fn pull_applies_puller_response() {
    let mut change = HashMap::new();
    change.insert(
        "todo".to_string(),
        vec![CollectionOp::Created { key: "k1".into(), value: json!({"title": "from remote"}) }],
    );
    let puller: Arc<dyn doc_client::Puller> = Arc::new(common::StaticPuller {
        response: doc_client::PullResponse { change, cursor: Some(json!("c1")), last_processed_mutation_id: 0 },
    });
    let db = test_database_with(Some(puller), HashMap::new()).await;

    let mut cdc = db.subscribe_to_cdc();
    db.pull().await.unwrap();

    let event = tokio::time::timeout(Duration::from_millis(500), cdc.recv()).await.unwrap().unwrap();
    match event {
        ChangeEvent::Insert { collection, key, value } => {
            assert_eq!(collection, "todo");
            assert_eq!(key, "k1");
            assert_eq!(value, json!({"title": "from remote"}));
        }
        other => panic!("expected Insert from the pulled response, got {other:?}"),
    }
}
