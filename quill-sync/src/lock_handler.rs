//! Distributed locks on the sync target
//!
//! Locks are JSON files under `.sync/locks/` on the target, one per
//! (kind, app type, client id). A lock is active while its embedded
//! timestamp is younger than the TTL; holders keep it alive by rewriting
//! the file from an auto-refresh task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quill_files::{FileApi, PutContent};
use quill_store::unix_ms;

use crate::errors::{Result, SyncError};

/// Remote directory holding lock files.
pub const LOCK_DIR: &str = ".sync/locks";

const DEFAULT_LOCK_TTL_MS: i64 = 180_000;
const DEFAULT_AUTO_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Lock kinds. Sync locks from different clients may overlap; an Exclusive
/// lock is mutually exclusive with everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Sync,
    Exclusive,
}

impl LockType {
    fn as_str(self) -> &'static str {
        match self {
            LockType::Sync => "sync",
            LockType::Exclusive => "exclusive",
        }
    }
}

/// Client application flavor, recorded in lock attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    Desktop,
    Mobile,
    Cli,
}

impl AppType {
    pub fn as_str(self) -> &'static str {
        match self {
            AppType::Desktop => "desktop",
            AppType::Mobile => "mobile",
            AppType::Cli => "cli",
        }
    }
}

/// One lock file's contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub lock_type: LockType,
    pub client_id: String,
    pub app_type: AppType,
    pub updated_time: i64,
}

/// Why an API call failed while the target was locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorStatus {
    /// Our own sync lock expired or was released.
    SyncLockGone,
    /// Another client holds an exclusive lock.
    HasExclusiveLock,
}

impl LockErrorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LockErrorStatus::SyncLockGone => "sync lock is gone",
            LockErrorStatus::HasExclusiveLock => "exclusive lock held by another client",
        }
    }
}

pub struct LockHandler {
    api: Arc<dyn FileApi>,
    lock_ttl_ms: i64,
    auto_refresh_interval: Duration,
    refresh_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

fn lock_file_name(lock_type: LockType, app_type: AppType, client_id: &str) -> String {
    format!(
        "{}_{}_{}.json",
        lock_type.as_str(),
        app_type.as_str(),
        client_id
    )
}

fn lock_file_path(lock_type: LockType, app_type: AppType, client_id: &str) -> String {
    format!("{}/{}", LOCK_DIR, lock_file_name(lock_type, app_type, client_id))
}

impl LockHandler {
    pub fn new(api: Arc<dyn FileApi>) -> Self {
        Self {
            api,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            auto_refresh_interval: DEFAULT_AUTO_REFRESH_INTERVAL,
            refresh_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Override TTL and refresh cadence, mainly for tests.
    pub fn with_timing(mut self, ttl_ms: i64, refresh_interval: Duration) -> Self {
        self.lock_ttl_ms = ttl_ms;
        self.auto_refresh_interval = refresh_interval;
        self
    }

    fn is_active(&self, lock: &Lock) -> bool {
        unix_ms() - lock.updated_time < self.lock_ttl_ms
    }

    /// All currently active locks on the target.
    pub async fn active_locks(&self) -> Result<Vec<Lock>> {
        let entries = self.api.list(LOCK_DIR).await?;
        let mut locks = Vec::new();
        for entry in entries {
            let path = format!("{}/{}", LOCK_DIR, entry.path);
            let Some(content) = self.api.get(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<Lock>(&content) {
                Ok(lock) if self.is_active(&lock) => locks.push(lock),
                Ok(_) => {}
                Err(e) => warn!("Ignoring unreadable lock file {}: {}", path, e),
            }
        }
        Ok(locks)
    }

    pub async fn has_active_lock(
        &self,
        lock_type: LockType,
        app_type: Option<AppType>,
        client_id: Option<&str>,
    ) -> Result<bool> {
        let locks = self.active_locks().await?;
        Ok(locks.iter().any(|lock| {
            lock.lock_type == lock_type
                && app_type.map_or(true, |a| lock.app_type == a)
                && client_id.map_or(true, |c| lock.client_id == c)
        }))
    }

    async fn write_lock(&self, lock: &Lock) -> Result<()> {
        let path = lock_file_path(lock.lock_type, lock.app_type, &lock.client_id);
        let body = serde_json::to_vec(lock)?;
        self.api.put(&path, PutContent::Bytes(Bytes::from(body))).await?;
        Ok(())
    }

    /// Acquire a lock for this client. Fails with [`SyncError::LockError`]
    /// when a conflicting lock is active, including one that appears in the
    /// window between our write and the re-check.
    pub async fn acquire_lock(
        &self,
        lock_type: LockType,
        app_type: AppType,
        client_id: &str,
    ) -> Result<Lock> {
        self.check_no_conflicting_lock(lock_type, client_id).await?;

        let lock = Lock {
            lock_type,
            client_id: client_id.to_string(),
            app_type,
            updated_time: unix_ms(),
        };
        self.write_lock(&lock).await?;

        // A competing client may have won the race while we wrote.
        if let Err(e) = self.check_no_conflicting_lock(lock_type, client_id).await {
            self.release_lock(lock_type, app_type, client_id).await?;
            return Err(e);
        }

        debug!(
            "Acquired {} lock for {} ({})",
            lock_type.as_str(),
            client_id,
            app_type.as_str()
        );
        Ok(lock)
    }

    async fn check_no_conflicting_lock(&self, lock_type: LockType, client_id: &str) -> Result<()> {
        let locks = self.active_locks().await?;
        for lock in &locks {
            let conflicts = match lock_type {
                // Sync locks only conflict with an exclusive lock.
                LockType::Sync => lock.lock_type == LockType::Exclusive,
                // Exclusive conflicts with every lock held by someone else.
                LockType::Exclusive => lock.client_id != client_id,
            };
            if conflicts {
                return Err(SyncError::LockError(format!(
                    "{} lock held by client {}",
                    lock.lock_type.as_str(),
                    lock.client_id
                )));
            }
        }
        Ok(())
    }

    pub async fn release_lock(
        &self,
        lock_type: LockType,
        app_type: AppType,
        client_id: &str,
    ) -> Result<()> {
        let path = lock_file_path(lock_type, app_type, client_id);
        self.api.delete(&path).await?;
        debug!("Released {} lock for {}", lock_type.as_str(), client_id);
        Ok(())
    }

    /// Rewrite the lock file with a fresh timestamp. Fails when the lock is
    /// no longer present (another client was free to take over) or when an
    /// exclusive lock from another client has appeared.
    pub async fn refresh_lock(&self, lock: &Lock) -> Result<Lock> {
        if lock.lock_type == LockType::Sync {
            let locks = self.active_locks().await?;
            if let Some(exclusive) = locks
                .iter()
                .find(|l| l.lock_type == LockType::Exclusive && l.client_id != lock.client_id)
            {
                return Err(SyncError::LockError(format!(
                    "exclusive lock held by client {}",
                    exclusive.client_id
                )));
            }
        }
        let path = lock_file_path(lock.lock_type, lock.app_type, &lock.client_id);
        if self.api.get(&path).await?.is_none() {
            return Err(SyncError::LockError(format!(
                "{} lock for {} expired or was released",
                lock.lock_type.as_str(),
                lock.client_id
            )));
        }
        let refreshed = Lock {
            updated_time: unix_ms(),
            ..lock.clone()
        };
        self.write_lock(&refreshed).await?;
        Ok(refreshed)
    }

    /// Spawn a task that refreshes the lock periodically. On any refresh
    /// failure `on_error` is invoked once and the task stops.
    pub fn start_auto_lock_refresh(
        self: &Arc<Self>,
        lock: Lock,
        on_error: Box<dyn Fn(SyncError) + Send + Sync>,
    ) {
        let key = lock_file_name(lock.lock_type, lock.app_type, &lock.client_id);
        let handler = Arc::clone(self);
        let interval = self.auto_refresh_interval;

        let task = tokio::spawn(async move {
            let mut lock = lock;
            loop {
                tokio::time::sleep(interval).await;
                match handler.refresh_lock(&lock).await {
                    Ok(refreshed) => {
                        debug!("Refreshed {} lock", lock.lock_type.as_str());
                        lock = refreshed;
                    }
                    Err(e) => {
                        warn!("Lock auto-refresh failed: {}", e);
                        on_error(e);
                        break;
                    }
                }
            }
        });

        let mut tasks = self.refresh_tasks.lock().unwrap();
        if let Some(previous) = tasks.insert(key, task) {
            previous.abort();
        }
    }

    pub fn stop_auto_lock_refresh(&self, lock: &Lock) {
        let key = lock_file_name(lock.lock_type, lock.app_type, &lock.client_id);
        if let Some(task) = self.refresh_tasks.lock().unwrap().remove(&key) {
            task.abort();
            info!("Stopped auto-refresh for {} lock", lock.lock_type.as_str());
        }
    }

    /// Classify the lock situation after an API error: our sync lock is
    /// gone, another client holds an exclusive lock, or neither.
    pub async fn lock_error_status(
        &self,
        app_type: AppType,
        client_id: &str,
    ) -> Result<Option<LockErrorStatus>> {
        let locks = self.active_locks().await?;
        if locks.iter().any(|l| {
            l.lock_type == LockType::Exclusive && l.client_id != client_id
        }) {
            return Ok(Some(LockErrorStatus::HasExclusiveLock));
        }
        let ours_active = locks.iter().any(|l| {
            l.lock_type == LockType::Sync
                && l.app_type == app_type
                && l.client_id == client_id
        });
        if !ours_active {
            return Ok(Some(LockErrorStatus::SyncLockGone));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_files::MemoryFileApi;

    fn handler() -> Arc<LockHandler> {
        let api: Arc<dyn FileApi> = Arc::new(MemoryFileApi::new(1));
        Arc::new(LockHandler::new(api))
    }

    #[tokio::test]
    async fn test_sync_locks_from_different_clients_overlap() {
        let handler = handler();
        handler
            .acquire_lock(LockType::Sync, AppType::Desktop, "client-a")
            .await
            .unwrap();
        handler
            .acquire_lock(LockType::Sync, AppType::Mobile, "client-b")
            .await
            .unwrap();

        assert!(handler
            .has_active_lock(LockType::Sync, None, Some("client-a"))
            .await
            .unwrap());
        assert!(handler
            .has_active_lock(LockType::Sync, None, Some("client-b"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_exclusive_blocks_sync_and_vice_versa() {
        let handler = handler();
        handler
            .acquire_lock(LockType::Exclusive, AppType::Desktop, "client-a")
            .await
            .unwrap();

        let err = handler
            .acquire_lock(LockType::Sync, AppType::Desktop, "client-b")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LockError(_)));

        handler
            .release_lock(LockType::Exclusive, AppType::Desktop, "client-a")
            .await
            .unwrap();
        handler
            .acquire_lock(LockType::Sync, AppType::Desktop, "client-b")
            .await
            .unwrap();

        let err = handler
            .acquire_lock(LockType::Exclusive, AppType::Desktop, "client-a")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LockError(_)));
    }

    #[tokio::test]
    async fn test_expired_lock_is_ignored() {
        let api: Arc<dyn FileApi> = Arc::new(MemoryFileApi::new(1));
        let handler =
            Arc::new(LockHandler::new(api).with_timing(0, Duration::from_secs(60)));
        handler
            .acquire_lock(LockType::Sync, AppType::Desktop, "client-a")
            .await
            .unwrap();
        // TTL of zero expires the lock immediately.
        assert!(!handler
            .has_active_lock(LockType::Sync, None, Some("client-a"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_refresh_fails_after_release() {
        let handler = handler();
        let lock = handler
            .acquire_lock(LockType::Sync, AppType::Desktop, "client-a")
            .await
            .unwrap();
        handler
            .release_lock(LockType::Sync, AppType::Desktop, "client-a")
            .await
            .unwrap();

        let err = handler.refresh_lock(&lock).await.unwrap_err();
        assert!(matches!(err, SyncError::LockError(_)));
    }

    #[tokio::test]
    async fn test_lock_error_status() {
        let handler = handler();

        // No sync lock at all: gone.
        assert_eq!(
            handler
                .lock_error_status(AppType::Desktop, "client-a")
                .await
                .unwrap(),
            Some(LockErrorStatus::SyncLockGone)
        );

        let _lock = handler
            .acquire_lock(LockType::Sync, AppType::Desktop, "client-a")
            .await
            .unwrap();
        assert_eq!(
            handler
                .lock_error_status(AppType::Desktop, "client-a")
                .await
                .unwrap(),
            None
        );

        // An exclusive lock from another client dominates.
        let exclusive = Lock {
            lock_type: LockType::Exclusive,
            client_id: "client-b".to_string(),
            app_type: AppType::Desktop,
            updated_time: unix_ms(),
        };
        handler.write_lock(&exclusive).await.unwrap();
        assert_eq!(
            handler
                .lock_error_status(AppType::Desktop, "client-a")
                .await
                .unwrap(),
            Some(LockErrorStatus::HasExclusiveLock)
        );
    }
}
