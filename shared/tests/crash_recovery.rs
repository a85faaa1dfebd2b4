mod common;

use common::{config, manual_engine, FakeRemote, T0};
use mutation_sync::{
    CryptoProvider, EnqueueRequest, FileStorage, ItemState, KeyRing, ManualClock, Operation,
    Priority, QueueStorage, StoreContext, SyncStatus,
};
use std::sync::Arc;
use std::time::Duration;

fn crypto() -> Arc<dyn CryptoProvider> {
    Arc::new(KeyRing::single(&[7u8; 32]).unwrap())
}

fn file_storage(path: &std::path::Path) -> Arc<dyn QueueStorage> {
    Arc::new(FileStorage::new(
        path,
        crypto(),
        StoreContext::new("user-1", "device-a"),
    ))
}

#[tokio::test]
async fn interrupted_dispatch_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.bin");

    // 1. First run: the send hangs, then the process "dies"
    let (stuck, _gate) = FakeRemote::gated();
    let engine = Arc::new(
        manual_engine(
            config(),
            file_storage(&path),
            Arc::new(stuck),
            Arc::new(ManualClock::new(T0)),
            true,
        )
        .await,
    );
    let receipt = engine
        .submit(
            EnqueueRequest::new(Operation::Create, "mood_entry", r#"{"mood_score":5}"#, Priority::High)
                .with_record_key("entry-9"),
        )
        .await
        .unwrap();

    let pass = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.dispatch_pass().await }
    });
    for _ in 0..200 {
        if engine.item(&receipt.item_id).await.map(|i| i.state) == Some(ItemState::Dispatching) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        engine.item(&receipt.item_id).await.unwrap().state,
        ItemState::Dispatching
    );
    pass.abort();
    let _ = pass.await;
    drop(engine);

    // 2. Restart: the claim on disk is reset and the item goes out again
    let remote = Arc::new(FakeRemote::new());
    let engine = manual_engine(
        config(),
        file_storage(&path),
        remote.clone(),
        Arc::new(ManualClock::new(T0.add_millis(60_000))),
        true,
    )
    .await;

    let recovered = engine.item(&receipt.item_id).await.unwrap();
    assert_eq!(recovered.state, ItemState::Queued);
    assert_eq!(recovered.attempt_count, 1);

    assert_eq!(engine.dispatch_pass().await, 1);
    assert_eq!(engine.item_status(&receipt.item_id).await, SyncStatus::Synced);
    assert_eq!(remote.writes().len(), 1);
    assert_eq!(remote.writes()[0].item_id, receipt.item_id);
    engine.shutdown().await.unwrap();

    // 3. Nothing left to do on the next start
    let loaded = file_storage(&path).load_all().await.unwrap();
    assert!(loaded.items.is_empty());
}

#[tokio::test]
async fn corrupted_store_is_quarantined_and_engine_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.bin");
    std::fs::write(&path, b"definitely not a sealed envelope").unwrap();

    let engine = manual_engine(
        config(),
        file_storage(&path),
        Arc::new(FakeRemote::new()),
        Arc::new(ManualClock::new(T0)),
        true,
    )
    .await;

    let stats = engine.queue_stats().await;
    assert_eq!(stats.size, 0);
    assert_eq!(stats.quarantined_count, 1);
    assert_eq!(engine.quarantined().await.len(), 1);
    assert_eq!(engine.metrics().quarantined, 1);

    // the store accepts new work right away
    engine
        .enqueue(Operation::Create, "mood_entry", r#"{"mood_score":1}"#, Priority::Normal)
        .await
        .unwrap();
    assert_eq!(engine.dispatch_pass().await, 1);
}

#[tokio::test]
async fn dead_letters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.bin");

    let remote = Arc::new(FakeRemote::new());
    remote.script(mutation_sync::RemoteOutcome::failure(mutation_sync::RemoteFailure::new(
        mutation_sync::ErrorCategory::ClientError,
        "400",
        "bad request",
    )));
    let engine = manual_engine(config(), file_storage(&path), remote, Arc::new(ManualClock::new(T0)), true).await;
    let id = engine
        .enqueue(Operation::Delete, "mood_entry", r#"{"id":"entry-4"}"#, Priority::Normal)
        .await
        .unwrap();
    engine.dispatch_pass().await;
    engine.shutdown().await.unwrap();
    drop(engine);

    let engine = manual_engine(
        config(),
        file_storage(&path),
        Arc::new(FakeRemote::new()),
        Arc::new(ManualClock::new(T0)),
        true,
    )
    .await;
    assert_eq!(engine.item_status(&id).await, SyncStatus::Failed);
    assert_eq!(engine.queue_stats().await.dead_letter_count, 1);

    engine.requeue_dead_letter(&id).await.unwrap();
    engine.dispatch_pass().await;
    assert_eq!(engine.item_status(&id).await, SyncStatus::Synced);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_backend_recovers_in_flight_items() {
    use mutation_sync::SqliteStorage;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let open = || -> Arc<dyn QueueStorage> {
        Arc::new(SqliteStorage::open(&path, crypto(), StoreContext::new("user-1", "device-a")).unwrap())
    };

    let storage = open();
    let engine = manual_engine(config(), storage.clone(), Arc::new(FakeRemote::new()), Arc::new(ManualClock::new(T0)), false).await;
    let id = engine
        .enqueue(Operation::Create, "mood_entry", r#"{"mood_score":2}"#, Priority::Normal)
        .await
        .unwrap();
    drop(engine);

    // simulate a claim that never settled
    let mut item = storage.load_all().await.unwrap().items.pop().unwrap();
    item.state = ItemState::Dispatching;
    storage.update(&item).await.unwrap();
    drop(storage);

    let remote = Arc::new(FakeRemote::new());
    let engine = manual_engine(config(), open(), remote.clone(), Arc::new(ManualClock::new(T0)), true).await;
    assert_eq!(engine.item(&id).await.unwrap().state, ItemState::Queued);
    engine.dispatch_pass().await;
    assert_eq!(engine.item_status(&id).await, SyncStatus::Synced);
    assert_eq!(remote.writes().len(), 1);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn garbage_sqlite_file_is_quarantined_and_replaced() {
    use mutation_sync::SqliteStorage;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    std::fs::write(&path, vec![0xAB; 8 * 1024]).unwrap();

    let storage: Arc<dyn QueueStorage> = Arc::new(
        SqliteStorage::open(&path, crypto(), StoreContext::new("user-1", "device-a")).unwrap(),
    );
    let engine = manual_engine(config(), storage, Arc::new(FakeRemote::new()), Arc::new(ManualClock::new(T0)), false).await;

    let quarantined = engine.quarantined().await;
    assert_eq!(quarantined.len(), 1);
    assert!(quarantined[0].key.contains("queue.db.corrupt-"));
    let aside = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("queue.db.corrupt-"))
        .count();
    assert_eq!(aside, 1);

    // the fresh database takes writes
    let id = engine
        .enqueue(Operation::Create, "mood_entry", r#"{"mood_score":1}"#, Priority::Normal)
        .await
        .unwrap();
    drop(engine);
    let reopened = SqliteStorage::open(&path, crypto(), StoreContext::new("user-1", "device-a")).unwrap();
    let loaded = reopened.load_all().await.unwrap();
    assert_eq!(loaded.items.len(), 1);
    assert_eq!(loaded.items[0].id, id);
    assert_eq!(loaded.quarantined.len(), 1);
}
