//! Distributed-lock behavior across competing instances: single winner,
//! stale-row reclaim, and takeover after a holder vanishes.

mod common;

use searchsync::lock::DistributedLock;
use searchsync::{MemoryStateStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_only_one_instance_wins() {
    common::init_tracing();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::with_lock_ttl_ms(200));

    let mut locks = Vec::new();
    for name in ["a", "b", "c", "d"] {
        locks.push(DistributedLock::new(
            Arc::clone(&store),
            &common::fast_config(name),
        ));
    }

    let session = CancellationToken::new();
    let mut winners = 0;
    let mut leases = Vec::new();
    for lock in &locks {
        if let Some(lease) = lock.try_acquire(&session).await.unwrap() {
            winners += 1;
            leases.push(lease);
        }
    }
    assert_eq!(winners, 1);

    for lease in leases {
        lease.release().await;
    }
}

#[tokio::test]
async fn test_crashed_holder_row_reclaimed_after_ttl() {
    common::init_tracing();
    let store = Arc::new(MemoryStateStore::with_lock_ttl_ms(200));

    // Holder "a" acquires and then "crashes": loops stop but the row stays.
    let lock_a = DistributedLock::new(store.clone(), &common::fast_config("a"));
    let session_a = CancellationToken::new();
    let lease_a = lock_a.acquire(&session_a).await.unwrap();
    session_a.cancel();
    drop(lease_a);

    // "b" cannot get in until the row's heartbeat goes stale.
    let lock_b = DistributedLock::new(store.clone(), &common::fast_config("b"));
    let session_b = CancellationToken::new();
    assert!(lock_b.try_acquire(&session_b).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let lease_b = lock_b.acquire(&session_b).await.unwrap();
    assert_eq!(lease_b.holder_id(), "b");
    assert_eq!(
        store.read_lock("search-sync").await.unwrap().unwrap().holder_id,
        "b"
    );
    lease_b.release().await;
}

#[tokio::test]
async fn test_waiting_acquire_succeeds_after_release() {
    common::init_tracing();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::with_lock_ttl_ms(200));

    let lock_a = DistributedLock::new(Arc::clone(&store), &common::fast_config("a"));
    let lock_b = DistributedLock::new(Arc::clone(&store), &common::fast_config("b"));

    let session_a = CancellationToken::new();
    let lease_a = lock_a.acquire(&session_a).await.unwrap();

    let session_b = CancellationToken::new();
    let waiter = tokio::spawn(async move { lock_b.acquire(&session_b).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    lease_a.release().await;

    let lease_b = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(lease_b.holder_id(), "b");
    lease_b.release().await;
}
