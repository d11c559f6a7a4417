//! Sync target version probing and layout upgrades

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use quill_files::{FileApi, PutContent};

use crate::errors::{Result, SyncError};
use crate::lock_handler::{AppType, LockHandler, LockType};

/// Highest target layout version this client can talk to.
pub const SUPPORTED_SYNC_VERSION: u32 = 3;

/// Version marker at the target root.
pub const VERSION_FILE_PATH: &str = "info.json";

#[derive(Debug, Serialize, Deserialize)]
struct TargetInfo {
    version: u32,
}

/// Result of probing the target. `version` is absent when the target is
/// empty and has never been initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub version: Option<u32>,
}

impl TargetStatus {
    /// Whether the layout must be (re)written before syncing.
    pub fn needs_upgrade(&self) -> bool {
        match self.version {
            None => true,
            Some(v) => v < SUPPORTED_SYNC_VERSION,
        }
    }
}

pub struct MigrationHandler {
    api: Arc<dyn FileApi>,
    lock_handler: Arc<LockHandler>,
    app_type: AppType,
    client_id: String,
}

impl MigrationHandler {
    pub fn new(
        api: Arc<dyn FileApi>,
        lock_handler: Arc<LockHandler>,
        app_type: AppType,
        client_id: String,
    ) -> Self {
        Self {
            api,
            lock_handler,
            app_type,
            client_id,
        }
    }

    /// Probe the target version. Fails with
    /// [`SyncError::OutdatedSyncTarget`] when the target was written by a
    /// newer client than this one supports.
    pub async fn check_can_sync(&self) -> Result<TargetStatus> {
        let Some(content) = self.api.get(VERSION_FILE_PATH).await? else {
            return Ok(TargetStatus { version: None });
        };
        let info: TargetInfo = serde_json::from_slice(&content)?;
        if info.version > SUPPORTED_SYNC_VERSION {
            return Err(SyncError::OutdatedSyncTarget {
                version: info.version,
                supported: SUPPORTED_SYNC_VERSION,
            });
        }
        Ok(TargetStatus {
            version: Some(info.version),
        })
    }

    /// Bootstrap or rewrite the target layout. Holds the exclusive lock for
    /// the duration so no other client syncs against a half-written layout.
    pub async fn upgrade(&self, target_version: u32) -> Result<()> {
        let lock = self
            .lock_handler
            .acquire_lock(LockType::Exclusive, self.app_type, &self.client_id)
            .await?;

        let result = self.apply_upgrade(target_version).await;

        self.lock_handler
            .release_lock(lock.lock_type, lock.app_type, &lock.client_id)
            .await?;
        result
    }

    async fn apply_upgrade(&self, target_version: u32) -> Result<()> {
        info!("Upgrading sync target to version {}", target_version);
        self.api.initialize().await?;
        let info = TargetInfo {
            version: target_version,
        };
        let body = serde_json::to_vec(&info)?;
        self.api
            .put(VERSION_FILE_PATH, PutContent::Bytes(Bytes::from(body)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_files::MemoryFileApi;

    fn fixture() -> MigrationHandler {
        let api: Arc<dyn FileApi> = Arc::new(MemoryFileApi::new(1));
        let locks = Arc::new(LockHandler::new(api.clone()));
        MigrationHandler::new(api, locks, AppType::Desktop, "client-a".to_string())
    }

    #[tokio::test]
    async fn test_empty_target_has_no_version() {
        let handler = fixture();
        let status = handler.check_can_sync().await.unwrap();
        assert_eq!(status.version, None);
        assert!(status.needs_upgrade());
    }

    #[tokio::test]
    async fn test_upgrade_then_check() {
        let handler = fixture();
        handler.upgrade(SUPPORTED_SYNC_VERSION).await.unwrap();

        let status = handler.check_can_sync().await.unwrap();
        assert_eq!(status.version, Some(SUPPORTED_SYNC_VERSION));
        assert!(!status.needs_upgrade());

        // The exclusive lock was released on the way out.
        assert!(!handler
            .lock_handler
            .has_active_lock(LockType::Exclusive, None, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_newer_target_is_rejected() {
        let handler = fixture();
        let body = serde_json::to_vec(&TargetInfo {
            version: SUPPORTED_SYNC_VERSION + 1,
        })
        .unwrap();
        handler
            .api
            .put(VERSION_FILE_PATH, PutContent::Bytes(Bytes::from(body)))
            .await
            .unwrap();

        let err = handler.check_can_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::OutdatedSyncTarget { .. }));
    }
}
