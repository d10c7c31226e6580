//! End-to-end scenarios across client, worker, manager, and storage.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use notewell_collab::client::{ClientOptions, CollabClient, CollabState};
use notewell_collab::disk::DebounceOptions;
use notewell_collab::manager::{CollabManager, ManagerOptions};
use notewell_collab::memory_storage::MemoryStorage;
use notewell_collab::protocol::CollabRequest;
use notewell_collab::step::Step;
use notewell_collab::storage::DiskStorage;
use notewell_collab::transport::{BoxFuture, CollabTransport, CollabWorker, TransportResult};

/// Transport wrapper whose target can be swapped out mid-session, standing
/// in for a worker that was torn down and restarted behind the editor.
struct SwitchableTransport {
    inner: RwLock<Arc<dyn CollabTransport>>,
}

impl SwitchableTransport {
    fn new(initial: Arc<dyn CollabTransport>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(initial),
        })
    }

    fn switch(&self, next: Arc<dyn CollabTransport>) {
        *self.inner.write().unwrap() = next;
    }
}

impl CollabTransport for SwitchableTransport {
    fn send_request(&self, request: CollabRequest) -> BoxFuture<'_, TransportResult> {
        let current = self.inner.read().unwrap().clone();
        Box::pin(async move { current.send_request(request).await })
    }
}

fn quiet_client_options(doc_name: &str, user_id: &str, client_id: &str) -> ClientOptions {
    let mut options = ClientOptions::new(doc_name, user_id, client_id);
    // Keep the poll timer out of the way; tests drive rounds explicitly.
    options.poll_interval = Duration::from_secs(3600);
    options
}

#[tokio::test]
async fn test_concurrent_edits_conflict_and_converge() {
    let storage = Arc::new(MemoryStorage::new());
    storage.save_doc("doc", "base", 0).unwrap();
    let manager = Arc::new(CollabManager::new(storage.clone(), ManagerOptions::default()));
    let (worker, transport) = CollabWorker::spawn(manager);
    let transport: Arc<dyn CollabTransport> = Arc::new(transport);

    let alice = CollabClient::start(
        transport.clone(),
        quiet_client_options("doc", "alice", "editor-a"),
    )
    .await
    .unwrap();
    let bob = CollabClient::start(
        transport.clone(),
        quiet_client_options("doc", "bob", "editor-b"),
    )
    .await
    .unwrap();

    // Stop the background tasks: apply_local_step's push wake would let them
    // race the hand-driven rounds; sync_now keeps working after stop().
    alice.stop().await;
    bob.stop().await;

    // Both edit position 0 of the same version concurrently.
    alice
        .apply_local_step(Step::insert_at(0, "alpha "))
        .await
        .unwrap();
    bob.apply_local_step(Step::insert_at(0, "beta "))
        .await
        .unwrap();

    // Alice wins the race; Bob's push conflicts and resolves by
    // pull-rebase-retry inside one round.
    alice.sync_now().await.unwrap();
    assert_eq!(alice.version().await, 1);

    bob.sync_now().await.unwrap();
    assert_eq!(bob.version().await, 2);
    assert_eq!(bob.document().await, "alpha beta base");
    assert_eq!(bob.unconfirmed_len().await, 0);

    // Alice pulls Bob's rebased step and converges.
    alice.sync_now().await.unwrap();
    assert_eq!(alice.version().await, 2);
    assert_eq!(alice.document().await, "alpha beta base");

    assert_eq!(alice.state(), CollabState::Synced);
    assert_eq!(bob.state(), CollabState::Synced);

    alice.stop().await;
    bob.stop().await;
    worker.shutdown().await;

    // Shutdown flushed the converged document.
    let stored = storage.load_doc("doc").unwrap().unwrap();
    assert_eq!(stored.content, "alpha beta base");
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn test_same_user_views_conflict_and_converge() {
    let storage = Arc::new(MemoryStorage::new());
    storage.save_doc("doc", "base", 0).unwrap();
    let manager = Arc::new(CollabManager::new(storage.clone(), ManagerOptions::default()));
    let (worker, transport) = CollabWorker::spawn(manager);
    let transport: Arc<dyn CollabTransport> = Arc::new(transport);

    // Two editor views of the same user, each with its own client id.
    let pane_a = CollabClient::start(
        transport.clone(),
        quiet_client_options("doc", "alice", "pane-a"),
    )
    .await
    .unwrap();
    let pane_b = CollabClient::start(
        transport.clone(),
        quiet_client_options("doc", "alice", "pane-b"),
    )
    .await
    .unwrap();

    // Stop the background tasks: apply_local_step's push wake would let them
    // race the hand-driven rounds; sync_now keeps working after stop().
    pane_a.stop().await;
    pane_b.stop().await;

    pane_a
        .apply_local_step(Step::insert_at(0, "A"))
        .await
        .unwrap();
    pane_b
        .apply_local_step(Step::insert_at(0, "B"))
        .await
        .unwrap();

    pane_a.sync_now().await.unwrap();
    assert_eq!(pane_a.version().await, 1);

    // Pane B conflicts at v0 and resolves by pull-rebase-retry. The shared
    // user id must not cost it the history it needs for that pull; losing
    // it would silently drop the edit through a refetch.
    pane_b.sync_now().await.unwrap();
    assert_eq!(pane_b.version().await, 2);
    assert_eq!(pane_b.document().await, "ABbase");
    assert_eq!(pane_b.unconfirmed_len().await, 0);

    pane_a.sync_now().await.unwrap();
    assert_eq!(pane_a.document().await, "ABbase");

    assert_eq!(pane_a.state(), CollabState::Synced);
    assert_eq!(pane_b.state(), CollabState::Synced);

    pane_a.stop().await;
    pane_b.stop().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_manager_restart_resyncs_client_and_discards_unconfirmed() {
    let storage = Arc::new(MemoryStorage::new());
    storage.save_doc("doc", "base", 0).unwrap();

    let first = Arc::new(CollabManager::new(storage.clone(), ManagerOptions::default()));
    let first_id = first.manager_id().to_string();
    let (first_worker, first_transport) = CollabWorker::spawn(first);
    let switchable = SwitchableTransport::new(Arc::new(first_transport));

    let client = CollabClient::start(
        switchable.clone(),
        quiet_client_options("doc", "alice", "editor-a"),
    )
    .await
    .unwrap();

    // Stop the background task so the draft below truly stays unpushed until
    // sync_now drives the round against the restarted manager.
    client.stop().await;

    // An edit that never gets pushed before the worker goes away.
    client
        .apply_local_step(Step::insert_at(4, " (draft)"))
        .await
        .unwrap();
    assert_eq!(client.unconfirmed_len().await, 1);

    first_worker.shutdown().await;

    let second = Arc::new(CollabManager::new(storage.clone(), ManagerOptions::default()));
    assert_ne!(second.manager_id(), first_id);
    let (second_worker, second_transport) = CollabWorker::spawn(second);
    switchable.switch(Arc::new(second_transport));

    // The push is stamped with the old manager id; the new manager rejects
    // it and the client falls back to a full refetch, dropping the draft.
    client.sync_now().await.unwrap();
    assert_eq!(client.state(), CollabState::Synced);
    assert_eq!(client.document().await, "base");
    assert_eq!(client.unconfirmed_len().await, 0);

    // The session works against the new incarnation from here on.
    client
        .apply_local_step(Step::insert_at(0, "fresh "))
        .await
        .unwrap();
    client.sync_now().await.unwrap();
    assert_eq!(client.document().await, "fresh base");
    assert_eq!(client.version().await, 1);

    client.stop().await;
    second_worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_edits_persist_debounced_not_immediately() {
    let storage = Arc::new(MemoryStorage::new());
    storage.save_doc("doc", "base", 0).unwrap();
    let manager = Arc::new(CollabManager::new(
        storage.clone(),
        ManagerOptions {
            max_retained_steps: 500,
            debounce: DebounceOptions {
                debounce_wait: Duration::from_millis(250),
                debounce_max_wait: Duration::from_millis(1000),
                max_flush_retries: 3,
            },
        },
    ));
    let sizes: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = sizes.clone();
    manager.set_on_pending_writes(Arc::new(move |size| {
        sink.lock().unwrap().push(size);
    }));
    let (worker, transport) = CollabWorker::spawn(manager);

    let client = CollabClient::start(
        Arc::new(transport),
        quiet_client_options("doc", "alice", "editor-a"),
    )
    .await
    .unwrap();

    for i in 0..3 {
        client
            .apply_local_step(Step::insert_at(0, "x"))
            .await
            .unwrap();
        client.sync_now().await.unwrap();
        assert_eq!(client.version().await, i + 1);
        // The authoritative version advanced but the write is still queued.
        assert_eq!(storage.load_doc("doc").unwrap().unwrap().version, 0);
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    let stored = storage.load_doc("doc").unwrap().unwrap();
    assert_eq!(stored.content, "xxxbase");
    assert_eq!(stored.version, 3);

    // One key queued once, flushed once.
    assert_eq!(*sizes.lock().unwrap(), vec![1, 0]);

    client.stop().await;
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_polling_picks_up_remote_steps() {
    let storage = Arc::new(MemoryStorage::new());
    storage.save_doc("doc", "base", 0).unwrap();
    let manager = Arc::new(CollabManager::new(storage, ManagerOptions::default()));
    let (worker, transport) = CollabWorker::spawn(manager);
    let transport: Arc<dyn CollabTransport> = Arc::new(transport);

    let writer = CollabClient::start(
        transport.clone(),
        quiet_client_options("doc", "alice", "editor-a"),
    )
    .await
    .unwrap();
    let mut reader_options = ClientOptions::new("doc", "bob", "editor-b");
    reader_options.poll_interval = Duration::from_millis(200);
    let reader = CollabClient::start(transport.clone(), reader_options)
        .await
        .unwrap();

    writer
        .apply_local_step(Step::insert_at(0, "hi "))
        .await
        .unwrap();
    writer.sync_now().await.unwrap();

    // No explicit sync on the reader: its poll tick delivers the step.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(reader.document().await, "hi base");
    assert_eq!(reader.version().await, 1);

    writer.stop().await;
    reader.stop().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_pulled_log_replays_to_served_document() {
    let storage = Arc::new(MemoryStorage::new());
    storage.save_doc("doc", "base", 0).unwrap();
    let manager = Arc::new(CollabManager::new(storage, ManagerOptions::default()));
    let manager_id = manager.manager_id().to_string();
    let (worker, transport) = CollabWorker::spawn(manager);
    let transport: Arc<dyn CollabTransport> = Arc::new(transport);

    let client = CollabClient::start(
        transport.clone(),
        quiet_client_options("doc", "alice", "editor-a"),
    )
    .await
    .unwrap();
    for step in [
        Step::insert_at(0, "one "),
        Step::insert_at(0, "two "),
        Step::delete(0, 4),
    ] {
        client.apply_local_step(step).await.unwrap();
        client.sync_now().await.unwrap();
    }

    let events = transport
        .send_request(CollabRequest::PullEvents {
            doc_name: "doc".to_string(),
            version: 0,
            user_id: "auditor".to_string(),
            manager_id,
        })
        .await
        .unwrap()
        .into_events()
        .unwrap();
    assert_eq!(events.steps.len(), 3);

    let mut replayed = "base".to_string();
    for step in &events.steps {
        replayed = step.apply(&replayed).unwrap();
    }

    let snapshot = transport
        .send_request(CollabRequest::GetDocument {
            doc_name: "doc".to_string(),
            user_id: "auditor".to_string(),
        })
        .await
        .unwrap()
        .into_document()
        .unwrap();
    assert_eq!(replayed, snapshot.doc);
    assert_eq!(events.version, snapshot.version);

    client.stop().await;
    worker.shutdown().await;
}

#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
#[tokio::test]
async fn test_sqlite_backed_session_survives_restart() {
    use notewell_collab::sqlite_storage::SqliteStorage;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("collab.db");

    {
        let storage = Arc::new(SqliteStorage::open(&path).unwrap());
        storage.save_doc("doc", "base", 0).unwrap();
        let manager = Arc::new(CollabManager::new(
            storage,
            ManagerOptions {
                max_retained_steps: 500,
                debounce: DebounceOptions {
                    debounce_wait: Duration::from_millis(10),
                    debounce_max_wait: Duration::from_millis(50),
                    max_flush_retries: 3,
                },
            },
        ));
        let (worker, transport) = CollabWorker::spawn(manager);
        let client = CollabClient::start(
            Arc::new(transport),
            quiet_client_options("doc", "alice", "editor-a"),
        )
        .await
        .unwrap();
        client
            .apply_local_step(Step::insert_at(4, "line"))
            .await
            .unwrap();
        client.sync_now().await.unwrap();
        client.stop().await;
        worker.shutdown().await;
    }

    // A new process: fresh storage handle, fresh manager, fresh id.
    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let manager = Arc::new(CollabManager::new(storage, ManagerOptions::default()));
    let (worker, transport) = CollabWorker::spawn(manager);
    let client = CollabClient::start(
        Arc::new(transport),
        quiet_client_options("doc", "bob", "editor-b"),
    )
    .await
    .unwrap();
    assert_eq!(client.document().await, "baseline");
    assert_eq!(client.version().await, 1);

    client.stop().await;
    worker.shutdown().await;
}
