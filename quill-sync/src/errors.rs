//! Error types for sync operations

use quill_files::FileApiError;
use quill_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync already in progress")]
    AlreadyStarted,

    #[error("Sync target is locked: {0}")]
    LockError(String),

    #[error("Sync target version {version} is newer than supported version {supported}")]
    OutdatedSyncTarget { version: u32, supported: u32 },

    #[error("Processing path twice: {0}")]
    ProcessingPathTwice(String),

    #[error("Delta fail-safe triggered: too many remote deletions")]
    FailSafe,

    #[error("Item is already encrypted: {0}")]
    CannotEncryptEncrypted(String),

    #[error("No active master key")]
    NoActiveMasterKey,

    #[error("Unknown item type: {0}")]
    UnknownItemType(i64),

    #[error("File API error: {0}")]
    Files(#[from] FileApiError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption service error: {0}")]
    Encryption(String),

    #[error("Share service error: {0}")]
    Share(String),
}

impl SyncError {
    /// Item-level failures: the item is disabled for this run and the batch
    /// continues. Covers backend rejections and request timeouts so one
    /// oversized upload cannot block progress indefinitely.
    pub fn is_cannot_sync_item(&self) -> bool {
        matches!(
            self,
            SyncError::Files(FileApiError::RejectedByTarget { .. })
                | SyncError::Files(FileApiError::Timeout(_))
        )
    }

    /// Transient transport failures, kept out of user-facing reports.
    pub fn is_retryable_network(&self) -> bool {
        matches!(self, SyncError::Files(e) if e.is_retryable())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
