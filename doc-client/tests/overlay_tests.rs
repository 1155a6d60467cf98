mod common;

use std::collections::HashMap;
use std::time::Duration;

use doc_client::{ChangeEvent, CollectionOp, Comparator, Condition, KvTransaction, PullResponse};
use serde_json::json;

use common::test_database;

/// S1 — insert then optimistic update, observed through both CDC and the
/// merged overlay read.
#[tokio::test]
async fn insert_then_update_emits_insert_and_update_cdc() {
    let db = test_database().await;
    let mut cdc = db.subscribe_to_cdc();

    db.mutate("create_todo", json!({"key": "k1"}), |tx| async move {
        tx.collection("todo")
            .insert("k1", json!({"title": "a", "status": "incomplete"}))
            .await
    })
    .await
    .unwrap();

    let insert_event = tokio::time::timeout(Duration::from_millis(500), cdc.recv()).await.unwrap().unwrap();
    match insert_event {
        ChangeEvent::Insert { collection, key, value } => {
            assert_eq!(collection, "todo");
            assert_eq!(key, "k1");
            assert_eq!(value, json!({"title": "a", "status": "incomplete"}));
        }
        other => panic!("expected Insert, got {other:?}"),
    }

    let delta = json_patch::diff(
        &json!({"title": "a", "status": "incomplete"}),
        &json!({"title": "b", "status": "incomplete"}),
    );
    db.mutate("update_todo", json!({"key": "k1"}), {
        let delta = delta.clone();
        move |tx| {
            let delta = delta.clone();
            async move { tx.collection("todo").update("k1", &delta).await }
        }
    })
    .await
    .unwrap();

    let update_event = tokio::time::timeout(Duration::from_millis(500), cdc.recv()).await.unwrap().unwrap();
    match update_event {
        ChangeEvent::Update { collection, key, post_update_value, .. } => {
            assert_eq!(collection, "todo");
            assert_eq!(key, "k1");
            assert_eq!(post_update_value, json!({"title": "b", "status": "incomplete"}));
        }
        other => panic!("expected Update, got {other:?}"),
    }

    let visible = db
        .batch_read(|overlay| async move { overlay.get_by_key("todo", "k1").await })
        .await
        .unwrap();
    assert_eq!(visible, Some(json!({"title": "b", "status": "incomplete"})));
}

/// S2 — an optimistic update that moves a row into a filtered set is visible
/// through `get_by_condition` even though the base row says otherwise.
#[tokio::test]
async fn optimistic_update_moves_row_into_filtered_set() {
    let db = test_database().await;

    let mut change = HashMap::new();
    change.insert(
        "todo".to_string(),
        vec![CollectionOp::Created { key: "k2".into(), value: json!({"status": "finished"}) }],
    );
    db.apply_change(PullResponse { change, cursor: None, last_processed_mutation_id: 0 }).await.unwrap();

    let delta = json_patch::diff(&json!({"status": "finished"}), &json!({"status": "incomplete"}));
    db.mutate("update_todo", json!({"key": "k2"}), move |tx| {
        let delta = delta.clone();
        async move { tx.collection("todo").update("k2", &delta).await }
    })
    .await
    .unwrap();

    let condition = Condition::new("status", Comparator::Eq, json!("incomplete")).unwrap();
    let matches = db
        .batch_read(move |overlay| async move { overlay.get_by_condition("todo", &condition).await })
        .await
        .unwrap();

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].key, "k2");
    assert_eq!(matches[0].value, json!({"status": "incomplete"}));
}

/// S6 — an authoritative Insert landing over a pending Update (whose base row
/// was meanwhile authoritatively deleted, leaving the Update mutation row
/// un-GC'd) merges the new base value with the still-pending delta rather
/// than clobbering it.
#[tokio::test]
async fn authoritative_insert_over_pending_update_yields_merged_insert() {
    let db = test_database().await;

    let mut seed = HashMap::new();
    seed.insert(
        "todo".to_string(),
        vec![CollectionOp::Created { key: "k".into(), value: json!({"title": "original", "status": "x"}) }],
    );
    db.apply_change(PullResponse { change: seed, cursor: None, last_processed_mutation_id: 0 }).await.unwrap();

    let delta = json_patch::diff(&json!({"title": "original"}), &json!({"title": "b"}));
    db.mutate("update_todo", json!({"key": "k"}), move |tx| {
        let delta = delta.clone();
        async move { tx.collection("todo").update("k", &delta).await }
    })
    .await
    .unwrap();

    // The base row is authoritatively deleted out from under the still-pending
    // Update (its mutation row survives until push/pull acknowledges it).
    let mut delete = HashMap::new();
    delete.insert("todo".to_string(), vec![CollectionOp::Deleted { key: "k".into() }]);
    db.apply_change(PullResponse { change: delete, cursor: None, last_processed_mutation_id: 0 }).await.unwrap();

    let mut cdc = db.subscribe_to_cdc();

    let mut authoritative_insert = HashMap::new();
    authoritative_insert.insert(
        "todo".to_string(),
        vec![CollectionOp::Created { key: "k".into(), value: json!({"title": "a", "status": "x"}) }],
    );
    db.apply_change(PullResponse { change: authoritative_insert, cursor: None, last_processed_mutation_id: 0 })
        .await
        .unwrap();

    let merged_event = tokio::time::timeout(Duration::from_millis(500), cdc.recv()).await.unwrap().unwrap();
    match merged_event {
        ChangeEvent::Insert { collection, key, value } => {
            assert_eq!(collection, "todo");
            assert_eq!(key, "k");
            assert_eq!(value, json!({"title": "b", "status": "x"}));
        }
        other => panic!("expected a merged Insert, got {other:?}"),
    }

    let base = db
        .batch_read(|overlay| async move { overlay.inner_mut().get_by_key("todo", "k").await.map_err(Into::into) })
        .await
        .unwrap();
    assert_eq!(base, Some(json!({"title": "a", "status": "x"})));
}

/// Invariant 1 — a write with no observable effect never emits CDC.
#[tokio::test]
async fn no_op_authoritative_write_emits_no_cdc() {
    let db = test_database().await;

    let mut seed = HashMap::new();
    seed.insert(
        "todo".to_string(),
        vec![CollectionOp::Created { key: "same".into(), value: json!({"title": "a"}) }],
    );
    db.apply_change(PullResponse { change: seed, cursor: None, last_processed_mutation_id: 0 }).await.unwrap();

    let mut cdc = db.subscribe_to_cdc();
    // drain the seed insert event if it hasn't been consumed yet by this new subscriber
    // (broadcast subscribers only see events sent after they subscribe, so nothing to drain)

    let mut repeat = HashMap::new();
    repeat.insert(
        "todo".to_string(),
        vec![CollectionOp::Updated { key: "same".into(), value: json!({"title": "a"}) }],
    );
    db.apply_change(PullResponse { change: repeat, cursor: None, last_processed_mutation_id: 0 }).await.unwrap();

    let result = tokio::time::timeout(Duration::from_millis(100), cdc.recv()).await;
    assert!(result.is_err(), "no-op authoritative write must not emit CDC");
}
