//! The synchronizer: three-phase reconciliation against a sync target
//!
//! One run drives UPLOAD (local to remote, with conflict resolution),
//! DELETE_REMOTE (propagate local deletions) and DELTA (remote to local via
//! the paginated change feed) in that order. The orchestration loop is a
//! single cooperative task; the only internal parallelism is the bounded
//! download queue used to prefetch delta content.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use quill_files::{DeltaOptions, DeltaPage, FileApi, FileApiError, ItemIdSource, PutContent, RemoteItem};
use quill_store::{
    deserialize_item, item_id_from_system_path, resource_blob_path, unix_ms, AsyncItemStore,
    ChangeSource, FetchStatus, Item, ItemType, SaveOptions, StoreError, CONFLICT_FOLDER_ID,
};

use crate::download_queue::DownloadQueue;
use crate::errors::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::hooks::SyncHook;
use crate::lock_handler::{AppType, Lock, LockHandler, LockType};
use crate::migration::{MigrationHandler, SUPPORTED_SYNC_VERSION};
use crate::report::{ProgressReport, SyncAction, SyncRunState};
use crate::services::{
    EncryptionService, NoopEncryptionService, NoopShareService, ShareService,
};
use crate::uploader::ItemUploader;

/// Resources at or above this size are not downloaded on mobile.
pub const MAX_RESOURCE_SIZE_MOBILE: i64 = 100 * 1024 * 1024;

/// Keys of derived caches inside the delta context. Dropped before the
/// context is handed to the persistence callback; drivers rebuild them.
const HEAVY_CONTEXT_KEYS: &[&str] = &["stats_cache", "pending_deletions"];

/// The three phases; a run may be restricted to a subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    UpdateRemote,
    DeleteRemote,
    Delta,
}

impl SyncStep {
    pub fn all() -> Vec<SyncStep> {
        vec![SyncStep::UpdateRemote, SyncStep::DeleteRemote, SyncStep::Delta]
    }
}

/// Continuation returned by a run and accepted by the next one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncContext {
    pub delta: Option<serde_json::Value>,
}

impl SyncContext {
    /// Copy with heavy derived caches removed, suitable for persistence.
    pub fn stripped(&self) -> SyncContext {
        let mut delta = self.delta.clone();
        if let Some(serde_json::Value::Object(map)) = &mut delta {
            for key in HEAVY_CONTEXT_KEYS {
                map.remove(*key);
            }
        }
        SyncContext { delta }
    }
}

pub type ProgressCallback = Arc<dyn Fn(ProgressReport) + Send + Sync>;
pub type SaveContextCallback = Arc<dyn Fn(&SyncContext) + Send + Sync>;

/// Options for one [`Synchronizer::start`] call.
#[derive(Default)]
pub struct SyncOptions {
    pub on_progress: Option<ProgressCallback>,
    /// Output context of the previous run.
    pub context: Option<SyncContext>,
    /// Phases to run; `None` runs all three.
    pub sync_steps: Option<Vec<SyncStep>>,
    /// Testing mode: re-throw the caught error after cleanup.
    pub throw_on_error: bool,
    /// Invoked after every completed delta page with the stripped context.
    pub save_context_handler: Option<SaveContextCallback>,
}

/// Static configuration of the synchronizer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub client_id: String,
    pub app_type: AppType,
    /// Abort DELTA when the driver reports an implausibly large deletion
    /// set.
    pub wipe_out_fail_safe: bool,
    /// Directory holding local resource blobs, one file per resource id.
    pub resource_dir: PathBuf,
    /// Resources at or above this size are sync-disabled instead of
    /// downloaded. `None` is unbounded.
    pub max_resource_size: Option<i64>,
    pub upload_batch_limit: usize,
    pub download_concurrency: usize,
    pub lock_ttl_ms: i64,
    pub lock_refresh_interval: Duration,
}

impl SyncConfig {
    pub fn new(client_id: impl Into<String>, app_type: AppType) -> Self {
        Self {
            client_id: client_id.into(),
            app_type,
            wipe_out_fail_safe: true,
            resource_dir: PathBuf::from("resources"),
            max_resource_size: match app_type {
                AppType::Mobile => Some(MAX_RESOURCE_SIZE_MOBILE),
                _ => None,
            },
            upload_batch_limit: 100,
            download_concurrency: 4,
            lock_ttl_ms: 180_000,
            lock_refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Supplies the driver with the set of item ids this client has uploaded,
/// for deletion detection on backends without a native change feed.
struct StoreIdSource {
    store: AsyncItemStore,
    sync_target_id: i32,
}

#[async_trait::async_trait]
impl ItemIdSource for StoreIdSource {
    async fn synced_item_ids(&self) -> quill_files::Result<Vec<String>> {
        self.store
            .synced_item_ids(self.sync_target_id)
            .await
            .map_err(|e| FileApiError::Internal(e.to_string()))
    }
}

pub struct Synchronizer {
    api: Arc<dyn FileApi>,
    store: AsyncItemStore,
    config: SyncConfig,
    lock_handler: Arc<LockHandler>,
    migration: MigrationHandler,
    events: EventBus,
    encryption: RwLock<Arc<dyn EncryptionService>>,
    share: RwLock<Arc<dyn ShareService>>,

    in_progress: Arc<AtomicBool>,
    cancelling: Arc<AtomicBool>,
    sync_target_is_locked: Arc<AtomicBool>,
    upgrade_required: Arc<AtomicBool>,
    report: Mutex<ProgressReport>,
    active_sync_lock: Mutex<Option<Lock>>,
    active_queue: Arc<Mutex<Option<Arc<DownloadQueue>>>>,

    #[cfg(feature = "test-hooks")]
    hooks: crate::hooks::HookRegistry,
}

impl Synchronizer {
    pub fn new(api: Arc<dyn FileApi>, store: AsyncItemStore, config: SyncConfig) -> Self {
        let lock_handler = Arc::new(
            LockHandler::new(api.clone())
                .with_timing(config.lock_ttl_ms, config.lock_refresh_interval),
        );
        let migration = MigrationHandler::new(
            api.clone(),
            lock_handler.clone(),
            config.app_type,
            config.client_id.clone(),
        );
        api.set_temp_dir_name(&format!("temp-{}", config.client_id));
        Self {
            api,
            store,
            config,
            lock_handler,
            migration,
            events: EventBus::new(),
            encryption: RwLock::new(Arc::new(NoopEncryptionService)),
            share: RwLock::new(Arc::new(NoopShareService)),
            in_progress: Arc::new(AtomicBool::new(false)),
            cancelling: Arc::new(AtomicBool::new(false)),
            sync_target_is_locked: Arc::new(AtomicBool::new(false)),
            upgrade_required: Arc::new(AtomicBool::new(false)),
            report: Mutex::new(ProgressReport::default()),
            active_sync_lock: Mutex::new(None),
            active_queue: Arc::new(Mutex::new(None)),
            #[cfg(feature = "test-hooks")]
            hooks: crate::hooks::HookRegistry::default(),
        }
    }

    pub fn set_encryption_service(&self, service: Arc<dyn EncryptionService>) {
        *self.encryption.write().unwrap() = service;
    }

    pub fn set_share_service(&self, service: Arc<dyn ShareService>) {
        *self.share.write().unwrap() = service;
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn lock_handler(&self) -> Arc<LockHandler> {
        self.lock_handler.clone()
    }

    pub fn state(&self) -> SyncRunState {
        if self.in_progress.load(Ordering::SeqCst) {
            SyncRunState::InProgress
        } else {
            SyncRunState::Idle
        }
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }

    /// Whether the target was found to be newer than this client supports.
    pub fn upgrade_required(&self) -> bool {
        self.upgrade_required.load(Ordering::SeqCst)
    }

    /// Snapshot of the current progress report.
    pub fn report(&self) -> ProgressReport {
        self.report.lock().unwrap().clone()
    }

    #[cfg(feature = "test-hooks")]
    pub fn hooks(&self) -> &crate::hooks::HookRegistry {
        &self.hooks
    }

    fn hook_enabled(&self, _hook: SyncHook) -> bool {
        #[cfg(feature = "test-hooks")]
        {
            return self.hooks.is_enabled(_hook);
        }
        #[cfg(not(feature = "test-hooks"))]
        {
            false
        }
    }

    fn cancelled(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }

    fn with_report(&self, f: impl FnOnce(&mut ProgressReport)) {
        f(&mut self.report.lock().unwrap());
    }

    fn publish_progress(&self, options: &SyncOptions) {
        let snapshot = self.report();
        self.events.dispatch(SyncEvent::ReportUpdate(snapshot.clone()));
        if let Some(on_progress) = &options.on_progress {
            on_progress(snapshot);
        }
    }

    /// Request cancellation without waiting for the run to wind down.
    fn request_cancel(&self) {
        if !self.cancelling.swap(true, Ordering::SeqCst) {
            info!("Cancelling sync");
            self.with_report(|r| r.cancelling = true);
        }
        if let Some(queue) = self.active_queue.lock().unwrap().clone() {
            queue.stop();
        }
    }

    /// Idempotent: flag the run as cancelling, stop the download queue and
    /// wait until the state is back to idle.
    pub async fn cancel(&self) {
        if !self.in_progress.load(Ordering::SeqCst) {
            return;
        }
        self.request_cancel();
        while self.in_progress.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Wait for any in-flight run to reach idle, polling at one-second
    /// intervals.
    pub async fn wait_for_sync_to_finish(&self) {
        while self.in_progress.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    // ----------------------------------------------------------------
    // API call wrappers: fast-fail while the target is locked, and
    // re-examine errors so a lock-induced failure is not mistaken for an
    // item-level one.
    // ----------------------------------------------------------------

    fn check_target_not_locked(&self) -> Result<()> {
        if self.sync_target_is_locked.load(Ordering::SeqCst) {
            return Err(SyncError::LockError(
                "sync target is locked, aborting API call".to_string(),
            ));
        }
        Ok(())
    }

    async fn remap_api_error(&self, err: SyncError) -> SyncError {
        if !matches!(err, SyncError::Files(_)) {
            return err;
        }
        // Only meaningful while we hold (or believe we hold) the sync lock.
        if self.active_sync_lock.lock().unwrap().is_none() {
            return err;
        }
        match self
            .lock_handler
            .lock_error_status(self.config.app_type, &self.config.client_id)
            .await
        {
            Ok(Some(status)) => {
                self.sync_target_is_locked.store(true, Ordering::SeqCst);
                SyncError::LockError(format!("{}: {}", status.as_str(), err))
            }
            _ => err,
        }
    }

    async fn api_stat(&self, path: &str) -> Result<Option<RemoteItem>> {
        self.check_target_not_locked()?;
        match self.api.stat(path).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.remap_api_error(e.into()).await),
        }
    }

    async fn api_get(&self, path: &str) -> Result<Option<Bytes>> {
        self.check_target_not_locked()?;
        match self.api.get(path).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.remap_api_error(e.into()).await),
        }
    }

    async fn api_put_file(
        &self,
        path: &str,
        local_path: PathBuf,
        share_id: Option<String>,
    ) -> Result<()> {
        self.check_target_not_locked()?;
        let content = PutContent::LocalFile {
            path: local_path,
            share_id,
        };
        match self.api.put(path, content).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.remap_api_error(e.into()).await),
        }
    }

    async fn api_delete(&self, path: &str) -> Result<()> {
        self.check_target_not_locked()?;
        match self.api.delete(path).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.remap_api_error(e.into()).await),
        }
    }

    async fn api_delta(
        &self,
        context: Option<serde_json::Value>,
        ids: &StoreIdSource,
    ) -> Result<DeltaPage> {
        self.check_target_not_locked()?;
        let options = DeltaOptions {
            context,
            all_item_ids: Some(ids),
            wipe_out_fail_safe: self.config.wipe_out_fail_safe,
        };
        match self.api.delta("", options).await {
            Ok(page) => Ok(page),
            Err(FileApiError::FailSafe) => Err(SyncError::FailSafe),
            Err(e) => Err(self.remap_api_error(e.into()).await),
        }
    }

    fn deserialize_remote(&self, bytes: &[u8]) -> Result<Item> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| StoreError::MalformedPayload(e.to_string()))?;
        match deserialize_item(text) {
            Ok(item) => Ok(item),
            Err(StoreError::UnknownItemType(n)) => Err(SyncError::UnknownItemType(n)),
            Err(e) => Err(e.into()),
        }
    }

    // ----------------------------------------------------------------
    // Entry point
    // ----------------------------------------------------------------

    /// Run a sync. Returns the output context to feed into the next run.
    pub async fn start(&self, options: SyncOptions) -> Result<SyncContext> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyStarted);
        }

        self.cancelling.store(false, Ordering::SeqCst);
        self.sync_target_is_locked.store(false, Ordering::SeqCst);
        *self.report.lock().unwrap() = ProgressReport::new(unix_ms());

        let steps = options.sync_steps.clone().unwrap_or_else(SyncStep::all);
        let is_full_sync = SyncStep::all().iter().all(|s| steps.contains(s));

        info!(
            "Sync started (client {}, target {})",
            self.config.client_id,
            self.api.sync_target_id()
        );
        self.events.dispatch(SyncEvent::Started);

        let mut output = options.context.clone().unwrap_or_default();
        let run_result = self.run_phases(&options, &steps, &mut output).await;

        // Cleanup runs on every exit path.
        self.release_sync_lock().await;
        *self.active_queue.lock().unwrap() = None;

        let caught = match run_result {
            Ok(()) => None,
            Err(err) => {
                self.classify_run_error(&err);
                Some(err)
            }
        };

        self.with_report(|r| {
            r.completed_time = Some(unix_ms());
            r.state = SyncRunState::Idle;
        });
        self.publish_progress(&options);

        let report = self.report();
        for line in report.to_lines() {
            info!("{}", line);
        }

        match self
            .store
            .disabled_sync_item_count(self.api.sync_target_id())
            .await
        {
            Ok(count) if count > 0 => self.events.dispatch(SyncEvent::HasDisabledSyncItems),
            Ok(_) => {}
            Err(e) => warn!("Could not count disabled sync items: {}", e),
        }

        self.events.dispatch(SyncEvent::Completed {
            is_full_sync,
            with_errors: !report.errors.is_empty(),
        });

        // Post-sync share upkeep must never affect the run outcome.
        if is_full_sync && caught.is_none() {
            let share = self.share.read().unwrap().clone();
            if let Err(e) = share.maintenance().await {
                warn!("Share maintenance failed: {}", e);
            }
        }

        self.cancelling.store(false, Ordering::SeqCst);
        self.in_progress.store(false, Ordering::SeqCst);
        info!("Sync complete");

        match caught {
            Some(err) if options.throw_on_error => Err(err),
            _ => Ok(output),
        }
    }

    /// Error ladder: decide what is fatal, what is user-visible and what is
    /// swallowed.
    fn classify_run_error(&self, err: &SyncError) {
        match err {
            SyncError::CannotEncryptEncrypted(_)
            | SyncError::NoActiveMasterKey
            | SyncError::ProcessingPathTwice(_)
            | SyncError::OutdatedSyncTarget { .. } => {
                info!("Sync run ended early: {}", err);
            }
            SyncError::FailSafe | SyncError::LockError(_) => {
                info!("Sync run ended early: {}", err);
                self.with_report(|r| r.errors.push(err.to_string()));
                for request in self.api.last_requests() {
                    warn!("Recent request: {} {}", request.op, request.path);
                }
            }
            SyncError::UnknownItemType(_) => {
                error!("Sync error: {}", err);
                self.with_report(|r| {
                    r.errors.push(
                        "Downloaded item is of an unsupported type. Please upgrade the application."
                            .to_string(),
                    )
                });
            }
            other => {
                error!("Sync error: {}", other);
                if !other.is_retryable_network() {
                    self.with_report(|r| r.errors.push(other.to_string()));
                }
            }
        }
    }

    async fn release_sync_lock(&self) {
        let lock = self.active_sync_lock.lock().unwrap().take();
        if let Some(lock) = lock {
            self.lock_handler.stop_auto_lock_refresh(&lock);
            if let Err(e) = self
                .lock_handler
                .release_lock(lock.lock_type, lock.app_type, &lock.client_id)
                .await
            {
                warn!("Failed to release sync lock: {}", e);
            }
        }
    }

    async fn run_phases(
        &self,
        options: &SyncOptions,
        steps: &[SyncStep],
        output: &mut SyncContext,
    ) -> Result<()> {
        let status = match self.migration.check_can_sync().await {
            Ok(status) => status,
            Err(err) => {
                if matches!(err, SyncError::OutdatedSyncTarget { .. }) {
                    self.upgrade_required.store(true, Ordering::SeqCst);
                }
                return Err(err);
            }
        };
        if status.needs_upgrade() {
            self.migration.upgrade(SUPPORTED_SYNC_VERSION).await?;
        }

        let lock = self
            .lock_handler
            .acquire_lock(LockType::Sync, self.config.app_type, &self.config.client_id)
            .await?;
        *self.active_sync_lock.lock().unwrap() = Some(lock.clone());

        let locked_flag = self.sync_target_is_locked.clone();
        let cancelling = self.cancelling.clone();
        let queue_slot = self.active_queue.clone();
        self.lock_handler.start_auto_lock_refresh(
            lock,
            Box::new(move |err| {
                warn!("Sync lock could not be refreshed, aborting run: {}", err);
                locked_flag.store(true, Ordering::SeqCst);
                cancelling.store(true, Ordering::SeqCst);
                if let Some(queue) = queue_slot.lock().unwrap().clone() {
                    queue.stop();
                }
            }),
        );

        if steps.contains(&SyncStep::UpdateRemote) && !self.cancelled() {
            self.upload_phase(options).await?;
        }
        if steps.contains(&SyncStep::DeleteRemote) && !self.cancelled() {
            self.delete_remote_phase(options).await?;
        }
        if steps.contains(&SyncStep::Delta) && !self.cancelled() {
            self.delta_phase(options, output).await?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Phase 1: UPLOAD
    // ----------------------------------------------------------------

    async fn upload_phase(&self, options: &SyncOptions) -> Result<()> {
        let sync_target_id = self.api.sync_target_id();
        let mut uploader = ItemUploader::new(self.api.clone());
        // Safety net: a path processed twice in one pass means remote
        // timestamps in the future or concurrent edits racing the upload.
        let mut done_paths: HashSet<String> = HashSet::new();

        loop {
            if self.cancelled() {
                break;
            }
            let batch = self
                .store
                .items_that_need_sync(sync_target_id, self.config.upload_batch_limit)
                .await?;
            if batch.items.is_empty() {
                break;
            }
            debug!(
                "Upload batch: {} items ({} never synced)",
                batch.items.len(),
                batch.never_synced_ids.len()
            );

            let pre_upload: Vec<&Item> = batch
                .items
                .iter()
                .filter(|item| {
                    batch.never_synced_ids.contains(&item.id)
                        && item.item_type != ItemType::Resource
                })
                .collect();
            uploader.pre_upload_items(&pre_upload).await?;

            for local in &batch.items {
                if self.cancelled() {
                    break;
                }
                let path = local.system_path();
                if !done_paths.insert(path.clone()) {
                    return Err(SyncError::ProcessingPathTwice(path));
                }

                let never_synced = batch.never_synced_ids.contains(&local.id);
                match self
                    .process_upload_item(&mut uploader, local, never_synced)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_cannot_sync_item() => {
                        warn!("Cannot sync item {}: {}", local.id, err);
                        self.store
                            .set_sync_disabled(sync_target_id, &local.id, &err.to_string())
                            .await?;
                    }
                    Err(err) => return Err(err),
                }
                self.publish_progress(options);
            }

            if !batch.has_more {
                break;
            }
        }
        Ok(())
    }

    async fn process_upload_item(
        &self,
        uploader: &mut ItemUploader,
        local: &Item,
        never_synced: bool,
    ) -> Result<()> {
        if self.hook_enabled(SyncHook::SkipRevisions) && local.item_type == ItemType::Revision {
            return Ok(());
        }

        let sync_target_id = self.api.sync_target_id();
        let path = local.system_path();
        let sync_time = self
            .store
            .sync_item(sync_target_id, &local.id)
            .await?
            .map(|s| s.sync_time)
            .unwrap_or(0);

        let remote_stat = if never_synced {
            None
        } else {
            self.api_stat(&path).await?
        };

        let (action, remote_content) = match remote_stat {
            None => {
                if sync_time == 0 {
                    (SyncAction::CreateRemote, None)
                } else {
                    // Remote was deleted while we hold local changes.
                    (conflict_action_for(local.item_type), None)
                }
            }
            Some(_) => match self.api_get(&path).await? {
                None => {
                    if sync_time == 0 {
                        (SyncAction::CreateRemote, None)
                    } else {
                        (conflict_action_for(local.item_type), None)
                    }
                }
                Some(bytes) => {
                    let remote_item = self.deserialize_remote(&bytes)?;
                    if remote_item.updated_time > sync_time {
                        (conflict_action_for(local.item_type), Some(remote_item))
                    } else {
                        (SyncAction::UpdateRemote, Some(remote_item))
                    }
                }
            },
        };

        match action {
            SyncAction::CreateRemote | SyncAction::UpdateRemote => {
                self.upload_item(uploader, local, action).await
            }
            conflict => {
                self.handle_upload_conflict(conflict, local, remote_content)
                    .await
            }
        }
    }

    async fn upload_item(
        &self,
        uploader: &mut ItemUploader,
        local: &Item,
        action: SyncAction,
    ) -> Result<()> {
        let sync_target_id = self.api.sync_target_id();

        if local.item_type == ItemType::Resource {
            let status = self.store.resource_fetch_status(&local.id).await?;
            if status != FetchStatus::Done {
                warn!(
                    "Resource {} blob not fetched yet ({:?}), disabling for this run",
                    local.id, status
                );
                self.store
                    .set_sync_disabled(
                        sync_target_id,
                        &local.id,
                        "resource blob has not been fetched yet",
                    )
                    .await?;
                return Ok(());
            }
            let blob_path = self.config.resource_dir.join(&local.id);
            let share_id = (!local.share_id.is_empty()).then(|| local.share_id.clone());
            self.api_put_file(&resource_blob_path(&local.id), blob_path, share_id)
                .await?;
        }

        if self.hook_enabled(SyncHook::NotesRejectedByTarget) && local.item_type == ItemType::Note
        {
            return Err(FileApiError::RejectedByTarget {
                path: local.system_path(),
                reason: "rejected by hook".to_string(),
            }
            .into());
        }

        match uploader.serialize_and_upload_item(local).await {
            Ok(()) => {}
            Err(err) => return Err(self.remap_api_error(err).await),
        }

        self.store
            .save_sync_time(sync_target_id, &local.id, local.updated_time)
            .await?;
        self.with_report(|r| r.increment(action));
        Ok(())
    }

    async fn handle_upload_conflict(
        &self,
        action: SyncAction,
        local: &Item,
        remote: Option<Item>,
    ) -> Result<()> {
        let sync_target_id = self.api.sync_target_id();
        info!("Conflict on {} resolved as {:?}", local.id, action);
        self.with_report(|r| r.increment(action));

        match action {
            SyncAction::NoteConflict => {
                if must_handle_conflict(local, remote.as_ref()) {
                    self.create_conflict_copy(local).await?;
                }
                self.resolve_with_remote(local, remote).await
            }
            SyncAction::ResourceConflict => {
                self.create_resource_conflict_note(local).await?;
                match remote {
                    Some(remote_item) => {
                        let sync_time = remote_item.updated_time;
                        self.store
                            .save_item(&remote_item, &SaveOptions::from_sync(sync_target_id, sync_time))
                            .await?;
                        // Force the blob to be fetched again.
                        self.store
                            .set_resource_fetch_status(&local.id, FetchStatus::Idle)
                            .await?;
                        Ok(())
                    }
                    None => {
                        self.store.delete_item(&local.id, None).await?;
                        self.with_report(|r| r.increment(SyncAction::DeleteLocal));
                        Ok(())
                    }
                }
            }
            _ => self.resolve_with_remote(local, remote).await,
        }
    }

    /// The remote version wins: overwrite local, or delete local when the
    /// remote is gone. Either way the change is sync-sourced and not queued
    /// back for upload.
    async fn resolve_with_remote(&self, local: &Item, remote: Option<Item>) -> Result<()> {
        let sync_target_id = self.api.sync_target_id();
        match remote {
            Some(remote_item) => {
                let sync_time = remote_item.updated_time;
                self.store
                    .save_item(&remote_item, &SaveOptions::from_sync(sync_target_id, sync_time))
                    .await?;
            }
            None => {
                self.store.delete_item(&local.id, None).await?;
                self.with_report(|r| r.increment(SyncAction::DeleteLocal));
            }
        }
        Ok(())
    }

    async fn create_conflict_copy(&self, local: &Item) -> Result<()> {
        self.store.ensure_conflict_folder().await?;
        let copy = local.to_conflict_copy();
        self.store
            .save_item(
                &copy,
                &SaveOptions {
                    auto_timestamp: false,
                    change_source: ChangeSource::Local,
                    sync_time: None,
                },
            )
            .await?;
        self.with_report(|r| r.increment(SyncAction::CreateLocal));
        Ok(())
    }

    async fn create_resource_conflict_note(&self, resource: &Item) -> Result<()> {
        self.store.ensure_conflict_folder().await?;
        let title = if resource.title.is_empty() {
            resource.filename.clone()
        } else {
            resource.title.clone()
        };
        let mut note = Item::new_note(
            title,
            format!(
                "The attachment below could not be synced and a conflict copy was kept.\n\n![{}](:/{})",
                resource.filename, resource.id
            ),
            CONFLICT_FOLDER_ID,
        );
        note.is_conflict = true;
        note.conflict_original_id = resource.id.clone();
        self.store
            .save_item(
                &note,
                &SaveOptions {
                    auto_timestamp: false,
                    change_source: ChangeSource::Local,
                    sync_time: None,
                },
            )
            .await?;
        self.with_report(|r| r.increment(SyncAction::CreateLocal));
        Ok(())
    }

    // ----------------------------------------------------------------
    // Phase 2: DELETE_REMOTE
    // ----------------------------------------------------------------

    async fn delete_remote_phase(&self, options: &SyncOptions) -> Result<()> {
        let sync_target_id = self.api.sync_target_id();
        let records = self.store.deleted_item_records(sync_target_id).await?;
        for record in records {
            if self.cancelled() {
                break;
            }
            debug!("Deleting remote item {}", record.item_id);
            self.api_delete(&quill_store::system_path_for_id(&record.item_id))
                .await?;
            if record.item_type == ItemType::Resource {
                self.api_delete(&resource_blob_path(&record.item_id)).await?;
            }
            self.store.remove_deleted_item_record(record.id).await?;
            self.with_report(|r| r.increment(SyncAction::DeleteRemote));
            self.publish_progress(options);
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Phase 3: DELTA
    // ----------------------------------------------------------------

    async fn delta_phase(&self, options: &SyncOptions, output: &mut SyncContext) -> Result<()> {
        let sync_target_id = self.api.sync_target_id();
        let queue = Arc::new(DownloadQueue::new(self.config.download_concurrency));
        *self.active_queue.lock().unwrap() = Some(queue.clone());

        let id_source = StoreIdSource {
            store: self.store.clone(),
            sync_target_id,
        };

        let master_keys_before = self.store.item_count(ItemType::MasterKey).await?;
        let mut encryption_enabled_this_run = false;
        let mut context = output.delta.clone();
        let mut local_folders_to_delete: Vec<String> = Vec::new();
        let mut page_index = 0usize;

        'pages: loop {
            if self.cancelled() {
                break;
            }
            let page = self.api_delta(context.clone(), &id_source).await?;
            page_index += 1;
            debug!(
                "Delta page {}: {} items, has_more={}",
                page_index,
                page.items.len(),
                page.has_more
            );

            if page_index == 2 && self.hook_enabled(SyncHook::CancelDeltaLoop2) {
                self.request_cancel();
            }

            // Enqueue downloads ahead of sequential processing.
            for remote in &page.items {
                if remote.is_deleted || remote.is_dir {
                    continue;
                }
                let Some(id) = item_id_from_system_path(&remote.path) else {
                    continue;
                };
                let local = self.store.load_item(id).await?;
                if self.content_unchanged(remote, local.as_ref()) {
                    continue;
                }
                let api = self.api.clone();
                let remote_path = remote.path.clone();
                self.with_report(|r| r.fetching_total += 1);
                queue.push(&remote.path, async move { api.get(&remote_path).await });
            }

            for remote in &page.items {
                if self.cancelled() {
                    break 'pages;
                }
                if remote.is_dir {
                    continue;
                }
                let Some(id) = item_id_from_system_path(&remote.path) else {
                    debug!("Skipping non-system path {}", remote.path);
                    continue;
                };

                let local = self.store.load_item(id).await?;

                if remote.is_deleted {
                    let Some(local) = local else {
                        continue;
                    };
                    if local.item_type == ItemType::Folder {
                        // Folders are deleted last, after all item
                        // processing, so contained notes can be rescued.
                        local_folders_to_delete.push(local.id.clone());
                    } else {
                        self.store.delete_item(&local.id, None).await?;
                        self.with_report(|r| r.increment(SyncAction::DeleteLocal));
                    }
                    self.publish_progress(options);
                    continue;
                }

                if self.content_unchanged(remote, local.as_ref()) {
                    continue;
                }

                let fetched = queue.wait_for_result(&remote.path).await;
                let bytes = match fetched {
                    None => {
                        // Scheduling was halted by cancellation.
                        if self.cancelled() {
                            break 'pages;
                        }
                        continue;
                    }
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => {
                        let err: SyncError = err.into();
                        if err.is_cannot_sync_item() {
                            warn!("Cannot fetch item {}: {}", id, err);
                            self.store
                                .set_sync_disabled(sync_target_id, id, &err.to_string())
                                .await?;
                            self.with_report(|r| r.fetching_processed += 1);
                            continue;
                        }
                        return Err(self.remap_api_error(err).await);
                    }
                };
                let Some(bytes) = bytes else {
                    // The object vanished between the listing and the get;
                    // a later page will report the deletion.
                    self.with_report(|r| r.fetching_processed += 1);
                    continue;
                };

                let mut content = self.deserialize_remote(&bytes)?;

                let action = match &local {
                    None => SyncAction::CreateLocal,
                    Some(local) if content.updated_time > local.updated_time => {
                        SyncAction::UpdateLocal
                    }
                    Some(_) => {
                        self.with_report(|r| r.fetching_processed += 1);
                        continue;
                    }
                };

                // User-visible timestamps default to the system pair.
                if content.user_updated_time == 0 {
                    content.user_updated_time = content.updated_time;
                }
                if content.user_created_time == 0 {
                    content.user_created_time = content.created_time;
                }

                if content.item_type == ItemType::Resource {
                    if let Some(max) = self.config.max_resource_size {
                        if content.size >= max {
                            warn!(
                                "Resource {} is {} bytes, above the {} byte limit; disabling",
                                content.id, content.size, max
                            );
                            self.store
                                .set_sync_disabled(
                                    sync_target_id,
                                    &content.id,
                                    &format!(
                                        "resource is larger than the maximum allowed size ({} bytes)",
                                        max
                                    ),
                                )
                                .await?;
                            self.with_report(|r| r.fetching_processed += 1);
                            continue;
                        }
                    }
                    // A later fetcher retrieves the blob.
                    self.store
                        .set_resource_fetch_status(&content.id, FetchStatus::Idle)
                        .await?;
                }

                let sync_time = content.updated_time;
                self.store
                    .save_item(&content, &SaveOptions::from_sync(sync_target_id, sync_time))
                    .await?;

                if content.item_type == ItemType::MasterKey {
                    if master_keys_before == 0 && !encryption_enabled_this_run {
                        encryption_enabled_this_run = true;
                        self.auto_enable_encryption(&content).await;
                    }
                    self.events.dispatch(SyncEvent::GotEncryptedItem);
                } else if content.encryption_applied {
                    self.events.dispatch(SyncEvent::GotEncryptedItem);
                }

                if content.item_type == ItemType::Resource {
                    self.events.dispatch(SyncEvent::CreatedOrUpdatedResource {
                        id: content.id.clone(),
                    });
                }

                self.with_report(|r| {
                    r.increment(action);
                    r.fetching_processed += 1;
                });
                self.publish_progress(options);
            }

            // The in-flight context is only persisted once the page has been
            // fully processed, so a cancelled run resumes from the previous
            // page.
            context = Some(page.context.clone());
            output.delta = Some(page.context);
            if let Some(handler) = &options.save_context_handler {
                handler(
                    &SyncContext {
                        delta: output.delta.clone(),
                    }
                    .stripped(),
                );
            }
            if !page.has_more {
                break;
            }
        }

        if !self.cancelled() {
            self.process_deferred_folder_deletions(&local_folders_to_delete)
                .await?;
            self.store.purge_orphaned_sync_items().await?;
        }
        Ok(())
    }

    fn content_unchanged(&self, remote: &RemoteItem, local: Option<&Item>) -> bool {
        if !self.api.supports_accurate_timestamp() {
            return false;
        }
        match (remote.jop_updated_time, local) {
            (Some(jop), Some(local)) => jop == local.updated_time,
            _ => false,
        }
    }

    /// The first master key observed when none existed locally switches
    /// encryption on. The user still has to provide the password through
    /// the encryption service, so failures here are logged, not fatal.
    async fn auto_enable_encryption(&self, master_key: &Item) {
        info!("First master key observed, enabling encryption");
        let encryption = self.encryption.read().unwrap().clone();
        if let Err(e) = encryption.enable_encryption(master_key).await {
            warn!("Could not enable encryption: {}", e);
        }
        if let Err(e) = encryption.load_master_keys_from_settings().await {
            warn!("Could not load master keys: {}", e);
        }
    }

    /// A folder deleted remotely while it still contains notes locally is a
    /// cross-client conflict: rescue the notes, then drop the folder
    /// without recursing and without queueing the deletion back out.
    async fn process_deferred_folder_deletions(&self, folder_ids: &[String]) -> Result<()> {
        for folder_id in folder_ids {
            let note_ids = self.store.folder_note_ids(folder_id).await?;
            if !note_ids.is_empty() {
                info!(
                    "Folder {} was deleted remotely but still holds {} notes; marking them as conflicts",
                    folder_id,
                    note_ids.len()
                );
                self.store.ensure_conflict_folder().await?;
                for note_id in note_ids {
                    let Some(mut note) = self.store.load_item(&note_id).await? else {
                        continue;
                    };
                    note.is_conflict = true;
                    note.parent_id = CONFLICT_FOLDER_ID.to_string();
                    self.store
                        .save_item(
                            &note,
                            &SaveOptions {
                                auto_timestamp: false,
                                change_source: ChangeSource::Local,
                                sync_time: None,
                            },
                        )
                        .await?;
                    self.with_report(|r| r.increment(SyncAction::NoteConflict));
                }
            }
            self.store.delete_item(folder_id, None).await?;
            self.with_report(|r| r.increment(SyncAction::DeleteLocal));
        }
        Ok(())
    }
}

fn conflict_action_for(item_type: ItemType) -> SyncAction {
    match item_type {
        ItemType::Note => SyncAction::NoteConflict,
        ItemType::Resource => SyncAction::ResourceConflict,
        _ => SyncAction::ItemConflict,
    }
}

/// Whether the divergence between local and remote is user-material. Purely
/// transient flags (todo completion) are not worth a conflict copy.
fn must_handle_conflict(local: &Item, remote: Option<&Item>) -> bool {
    let Some(remote) = remote else {
        return true;
    };
    if local.encryption_applied || remote.encryption_applied {
        return true;
    }
    local.title != remote.title || local.body != remote.body
}
