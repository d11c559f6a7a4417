//! End-to-end sync scenarios against the in-memory reference backend
//!
//! Multi-client flows are simulated by pointing several synchronizers, each
//! with its own local store, at one shared backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use quill_files::{FileApi, MemoryFileApi, PutContent};
use quill_store::{
    serialize_item, AsyncItemStore, Item, ItemType, SaveOptions, CONFLICT_FOLDER_ID,
};
use quill_sync::{
    AppType, EncryptionService, SyncConfig, SyncContext, SyncEvent, SyncHook, SyncOptions,
    SyncRunState, Synchronizer,
};

async fn make_client(
    api: Arc<MemoryFileApi>,
    client_id: &str,
    app_type: AppType,
) -> (Synchronizer, AsyncItemStore) {
    let store = AsyncItemStore::open_in_memory().await.unwrap();
    let sync = Synchronizer::new(api, store.clone(), SyncConfig::new(client_id, app_type));
    (sync, store)
}

async fn seed_remote(api: &MemoryFileApi, item: &Item) {
    api.put(
        &item.system_path(),
        PutContent::Bytes(Bytes::from(serialize_item(item))),
    )
    .await
    .unwrap();
}

async fn full_sync(sync: &Synchronizer) -> SyncContext {
    sync.start(SyncOptions {
        throw_on_error: true,
        ..Default::default()
    })
    .await
    .unwrap()
}

/// Let the wall clock tick so client-assigned millisecond timestamps of
/// consecutive edits differ.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn s1_fresh_client_bootstrap() {
    let api = Arc::new(MemoryFileApi::new(1));

    let folder = Item::new_folder("Inbox");
    for i in 0..3 {
        let note = Item::new_note(format!("note {}", i), "body", &folder.id);
        seed_remote(&api, &note).await;
    }
    seed_remote(&api, &folder).await;

    let (sync, store) = make_client(api.clone(), "client-b", AppType::Desktop).await;
    let mut rx = sync.subscribe();
    let context = full_sync(&sync).await;

    let report = sync.report();
    assert_eq!(report.create_local, 4);
    assert_eq!(report.create_remote, 0);
    assert_eq!(report.delete_local, 0);
    assert_eq!(store.item_count(ItemType::Note).await.unwrap(), 3);
    assert_eq!(store.item_count(ItemType::Folder).await.unwrap(), 1);

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::Completed { is_full_sync: true, with_errors: false })));

    // Round-trip idempotence: a second run performs zero writes.
    sync.start(SyncOptions {
        throw_on_error: true,
        context: Some(context),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(sync.report().total_changes(), 0);
}

#[tokio::test]
async fn s2_concurrent_edit_conflict() {
    let api = Arc::new(MemoryFileApi::new(1));
    let (sync_a, store_a) = make_client(api.clone(), "client-a", AppType::Desktop).await;
    let (sync_b, store_b) = make_client(api.clone(), "client-b", AppType::Desktop).await;

    // Client A creates a note and syncs; client B pulls it.
    let note = store_a
        .save_item(&Item::new_note("shared", "original", ""), &SaveOptions::default())
        .await
        .unwrap();
    full_sync(&sync_a).await;
    full_sync(&sync_b).await;
    assert!(store_b.load_item(&note.id).await.unwrap().is_some());

    // Both clients edit; A syncs first.
    tick().await;
    let mut b_version = store_b.load_item(&note.id).await.unwrap().unwrap();
    b_version.body = "edited on B".to_string();
    store_b.save_item(&b_version, &SaveOptions::default()).await.unwrap();

    tick().await;
    let mut a_version = store_a.load_item(&note.id).await.unwrap().unwrap();
    a_version.body = "edited on A".to_string();
    store_a.save_item(&a_version, &SaveOptions::default()).await.unwrap();
    full_sync(&sync_a).await;

    // B's sync detects the conflict during upload.
    full_sync(&sync_b).await;
    let report = sync_b.report();
    assert_eq!(report.note_conflict, 1);
    assert_eq!(report.create_local, 1);

    // B's copy was overwritten by the remote (A's) version.
    let local = store_b.load_item(&note.id).await.unwrap().unwrap();
    assert_eq!(local.body, "edited on A");

    // The conflict duplicate preserves B's edits.
    let conflict_notes = store_b.folder_note_ids(CONFLICT_FOLDER_ID).await.unwrap();
    assert_eq!(conflict_notes.len(), 1);
    let copy = store_b.load_item(&conflict_notes[0]).await.unwrap().unwrap();
    assert_eq!(copy.body, "edited on B");
    assert_eq!(copy.conflict_original_id, note.id);
}

#[tokio::test]
async fn s3_remote_deleted_local_modified() {
    let api = Arc::new(MemoryFileApi::new(1));
    let (sync_a, store_a) = make_client(api.clone(), "client-a", AppType::Desktop).await;
    let (sync_b, store_b) = make_client(api.clone(), "client-b", AppType::Desktop).await;

    let note = store_a
        .save_item(&Item::new_note("doomed", "original", ""), &SaveOptions::default())
        .await
        .unwrap();
    full_sync(&sync_a).await;
    full_sync(&sync_b).await;

    // A deletes the note and propagates the deletion.
    store_a.delete_item(&note.id, Some(1)).await.unwrap();
    full_sync(&sync_a).await;
    assert!(api.get(&note.system_path()).await.unwrap().is_none());

    // B modified the same note offline.
    tick().await;
    let mut b_version = store_b.load_item(&note.id).await.unwrap().unwrap();
    b_version.body = "edited offline".to_string();
    store_b.save_item(&b_version, &SaveOptions::default()).await.unwrap();

    full_sync(&sync_b).await;
    let report = sync_b.report();
    assert_eq!(report.note_conflict, 1);
    assert_eq!(report.delete_local, 1);

    // The note is gone but its content survives as a conflict copy.
    assert!(store_b.load_item(&note.id).await.unwrap().is_none());
    let conflict_notes = store_b.folder_note_ids(CONFLICT_FOLDER_ID).await.unwrap();
    assert_eq!(conflict_notes.len(), 1);
    let copy = store_b.load_item(&conflict_notes[0]).await.unwrap().unwrap();
    assert_eq!(copy.body, "edited offline");
}

#[tokio::test]
async fn s4_large_resource_on_mobile() {
    let api = Arc::new(MemoryFileApi::new(1));

    let resource = Item::new_resource("video.mp4", "video/mp4", 120 * 1024 * 1024);
    seed_remote(&api, &resource).await;
    let note = Item::new_note("small note", "", "");
    seed_remote(&api, &note).await;

    let (sync, store) = make_client(api.clone(), "client-mobile", AppType::Mobile).await;
    let mut rx = sync.subscribe();
    full_sync(&sync).await;

    // The oversized resource was never materialized locally.
    assert!(store.load_item(&resource.id).await.unwrap().is_none());
    let sync_item = store.sync_item(1, &resource.id).await.unwrap().unwrap();
    assert!(sync_item.sync_disabled);
    assert!(sync_item.sync_disabled_reason.contains("maximum"));

    // The rest of the batch is unaffected.
    assert!(store.load_item(&note.id).await.unwrap().is_some());

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::HasDisabledSyncItems)));
}

struct RecordingEncryption {
    enabled: AtomicBool,
    keys_loaded: AtomicBool,
}

#[async_trait::async_trait]
impl EncryptionService for RecordingEncryption {
    async fn enable_encryption(&self, _master_key: &Item) -> quill_sync::Result<()> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn load_master_keys_from_settings(&self) -> quill_sync::Result<()> {
        self.keys_loaded.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn s5_first_master_key_enables_encryption() {
    let api = Arc::new(MemoryFileApi::new(1));
    let master_key = Item::new_master_key("opaque-key-material");
    seed_remote(&api, &master_key).await;

    let (sync, store) = make_client(api.clone(), "client-b", AppType::Desktop).await;
    assert_eq!(store.item_count(ItemType::MasterKey).await.unwrap(), 0);

    let encryption = Arc::new(RecordingEncryption {
        enabled: AtomicBool::new(false),
        keys_loaded: AtomicBool::new(false),
    });
    sync.set_encryption_service(encryption.clone());

    let mut rx = sync.subscribe();
    full_sync(&sync).await;

    assert!(encryption.enabled.load(Ordering::SeqCst));
    assert!(encryption.keys_loaded.load(Ordering::SeqCst));
    assert_eq!(store.item_count(ItemType::MasterKey).await.unwrap(), 1);

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::GotEncryptedItem)));
}

#[tokio::test]
async fn s6_cancellation_mid_delta_resumes_cleanly() {
    let api = Arc::new(MemoryFileApi::new(1).with_delta_page_size(2));
    for i in 0..6 {
        let note = Item::new_note(format!("note {}", i), "body", "");
        seed_remote(&api, &note).await;
    }

    let (sync, store) = make_client(api.clone(), "client-b", AppType::Desktop).await;
    sync.hooks().enable(SyncHook::CancelDeltaLoop2);

    let saved_contexts: Arc<Mutex<Vec<SyncContext>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = saved_contexts.clone();
    sync.start(SyncOptions {
        throw_on_error: true,
        save_context_handler: Some(Arc::new(move |context: &SyncContext| {
            sink.lock().unwrap().push(context.clone());
        })),
        ..Default::default()
    })
    .await
    .unwrap();

    // Only the first page was applied, and only its context was persisted.
    assert_eq!(sync.report().create_local, 2);
    assert_eq!(saved_contexts.lock().unwrap().len(), 1);
    assert_eq!(sync.state(), SyncRunState::Idle);
    assert!(!sync
        .lock_handler()
        .has_active_lock(quill_sync::LockType::Sync, None, Some("client-b"))
        .await
        .unwrap());

    // Resuming from the persisted context picks up page 2 without
    // duplicating page 1's items.
    sync.hooks().disable(SyncHook::CancelDeltaLoop2);
    let resume_context = saved_contexts.lock().unwrap().last().unwrap().clone();
    sync.start(SyncOptions {
        throw_on_error: true,
        context: Some(resume_context),
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(sync.report().create_local, 4);
    assert_eq!(store.item_count(ItemType::Note).await.unwrap(), 6);
}

#[tokio::test]
async fn timeout_on_one_item_leaves_batch_unaffected() {
    let api = Arc::new(MemoryFileApi::new(1));
    let slow = Item::new_note("slow", "", "");
    let fast = Item::new_note("fast", "", "");
    seed_remote(&api, &slow).await;
    seed_remote(&api, &fast).await;
    api.inject_get_timeout(&slow.system_path());

    let (sync, store) = make_client(api.clone(), "client-b", AppType::Desktop).await;
    full_sync(&sync).await;

    // The timed-out item was disabled for this run, not fatal.
    assert!(store.load_item(&fast.id).await.unwrap().is_some());
    assert!(store.load_item(&slow.id).await.unwrap().is_none());
    let sync_item = store.sync_item(1, &slow.id).await.unwrap().unwrap();
    assert!(sync_item.sync_disabled);
    assert!(sync.report().errors.is_empty());

    // With the transient fault gone, a fresh walk picks the item up.
    full_sync(&sync).await;
    assert!(store.load_item(&slow.id).await.unwrap().is_some());
}

#[tokio::test]
async fn fail_safe_aborts_on_mass_remote_deletion() {
    let api = Arc::new(MemoryFileApi::new(1));
    let (sync, store) = make_client(api.clone(), "client-a", AppType::Desktop).await;

    let a = store
        .save_item(&Item::new_note("a", "", ""), &SaveOptions::default())
        .await
        .unwrap();
    let b = store
        .save_item(&Item::new_note("b", "", ""), &SaveOptions::default())
        .await
        .unwrap();
    full_sync(&sync).await;

    // The whole target is wiped, e.g. by a mis-configured client.
    api.delete(&a.system_path()).await.unwrap();
    api.delete(&b.system_path()).await.unwrap();

    // The deletions are NOT applied locally; the run ends with a
    // user-visible error instead.
    sync.start(SyncOptions::default()).await.unwrap();
    let report = sync.report();
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("fail-safe"));
    assert_eq!(store.item_count(ItemType::Note).await.unwrap(), 2);
}

#[tokio::test]
async fn create_sync_delete_sync_round_trip() {
    let api = Arc::new(MemoryFileApi::new(1));
    let (sync, store) = make_client(api.clone(), "client-a", AppType::Desktop).await;

    let note = store
        .save_item(&Item::new_note("transient", "", ""), &SaveOptions::default())
        .await
        .unwrap();
    full_sync(&sync).await;
    assert!(api.get(&note.system_path()).await.unwrap().is_some());

    store.delete_item(&note.id, Some(1)).await.unwrap();
    full_sync(&sync).await;
    assert!(api.get(&note.system_path()).await.unwrap().is_none());
    assert_eq!(sync.report().delete_remote, 1);
}

#[tokio::test]
async fn folder_deleted_remotely_with_local_notes_rescues_them() {
    let api = Arc::new(MemoryFileApi::new(1));
    let (sync_a, store_a) = make_client(api.clone(), "client-a", AppType::Desktop).await;
    let (sync_b, store_b) = make_client(api.clone(), "client-b", AppType::Desktop).await;

    // A folder with a note, known to both clients.
    let folder = store_a
        .save_item(&Item::new_folder("project"), &SaveOptions::default())
        .await
        .unwrap();
    let note = store_a
        .save_item(
            &Item::new_note("keep me", "important", &folder.id),
            &SaveOptions::default(),
        )
        .await
        .unwrap();
    full_sync(&sync_a).await;
    full_sync(&sync_b).await;

    // A deletes the folder only; B creates another note in it offline.
    store_a.delete_item(&folder.id, Some(1)).await.unwrap();
    full_sync(&sync_a).await;

    tick().await;
    let extra = store_b
        .save_item(
            &Item::new_note("offline addition", "", &folder.id),
            &SaveOptions::default(),
        )
        .await
        .unwrap();
    full_sync(&sync_b).await;

    // The folder is gone on B, but its notes were marked as conflicts
    // instead of being dropped.
    assert!(store_b.load_item(&folder.id).await.unwrap().is_none());
    let rescued = store_b.load_item(&note.id).await.unwrap().unwrap();
    assert!(rescued.is_conflict);
    assert_eq!(rescued.parent_id, CONFLICT_FOLDER_ID);
    let offline = store_b.load_item(&extra.id).await.unwrap().unwrap();
    assert!(offline.is_conflict);
    assert!(sync_b.report().note_conflict >= 2);
}
