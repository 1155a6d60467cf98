use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use doc_client::{LockController, LockStore, MetaLockStore};
use serde_json::json;
use uuid::Uuid;

mod common;
use common::test_store;

#[tokio::test]
async fn second_request_waits_for_first_to_release() {
    let store = test_store().await;
    let lock_store: Arc<dyn LockStore> = Arc::new(MetaLockStore::new(store));
    let controller = Arc::new(LockController::new(lock_store, Duration::from_millis(20)));

    let first_holds = Arc::new(AtomicBool::new(false));
    let second_acquired = Arc::new(AtomicBool::new(false));

    let holder = {
        let controller = controller.clone();
        let first_holds = first_holds.clone();
        tokio::spawn(async move {
            controller
                .request("demo", Duration::from_secs(5), || async {
                    first_holds.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok::<(), doc_client::ClientError>(())
                })
                .await
                .unwrap();
        })
    };

    while !first_holds.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let waiter = {
        let controller = controller.clone();
        let second_acquired = second_acquired.clone();
        tokio::spawn(async move {
            controller
                .request("demo", Duration::from_secs(5), || async {
                    second_acquired.store(true, Ordering::SeqCst);
                    Ok::<(), doc_client::ClientError>(())
                })
                .await
                .unwrap();
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second_acquired.load(Ordering::SeqCst), "second requester must wait while the first holds the lock");

    holder.await.unwrap();
    waiter.await.unwrap();
    assert!(second_acquired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stale_lock_is_force_removed_after_timeout() {
    let store = test_store().await;
    let lock_store: Arc<dyn LockStore> = Arc::new(MetaLockStore::new(store));

    // simulate a crashed owner: a lock entry written directly, never released
    lock_store
        .write("demo", json!({"locked": true, "owner_id": Uuid::new_v4()}))
        .await
        .unwrap();

    let controller = LockController::new(lock_store, Duration::from_millis(20));
    let timeout = Duration::from_millis(100);
    let started = Instant::now();

    controller
        .request("demo", timeout, || async { Ok::<(), doc_client::ClientError>(()) })
        .await
        .unwrap();

    assert!(started.elapsed() >= timeout, "acquiring a stale lock must wait out the full timeout before force-removing it");
}

#[tokio::test]
async fn lock_is_released_even_when_callback_errors() {
    let store = test_store().await;
    let lock_store: Arc<dyn LockStore> = Arc::new(MetaLockStore::new(store));
    let controller = LockController::new(lock_store, Duration::from_millis(10));

    let result = controller
        .request("demo", Duration::from_secs(5), || async {
            Err::<(), doc_client::ClientError>(doc_client::ClientError::AlreadyInitialized)
        })
        .await;
    assert!(result.is_err());

    // a second request must acquire immediately rather than waiting out a timeout
    let started = Instant::now();
    controller
        .request("demo", Duration::from_secs(5), || async { Ok::<(), doc_client::ClientError>(()) })
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}
