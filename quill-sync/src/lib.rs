//! Synchronization engine for the Quill notes application
//!
//! This crate provides the central synchronization engine that manages:
//! - The three-phase sync protocol (upload, remote deletions, delta pull)
//! - Conflict detection and resolution with a local Conflicts folder
//! - Distributed sync/exclusive locks on the target with auto-refresh
//! - Target layout version probing and upgrades
//! - Batched uploads and bounded-concurrency content prefetching
//! - Progress reporting and domain events

pub mod download_queue;
pub mod errors;
pub mod events;
pub mod hooks;
pub mod lock_handler;
pub mod migration;
pub mod report;
pub mod services;
pub mod synchronizer;
pub mod uploader;

pub use download_queue::{DownloadQueue, FetchResult};
pub use errors::{Result, SyncError};
pub use events::{EventBus, SyncEvent};
pub use hooks::SyncHook;
pub use lock_handler::{AppType, Lock, LockErrorStatus, LockHandler, LockType, LOCK_DIR};
pub use migration::{MigrationHandler, TargetStatus, SUPPORTED_SYNC_VERSION, VERSION_FILE_PATH};
pub use report::{ProgressReport, SyncAction, SyncRunState};
pub use services::{EncryptionService, NoopEncryptionService, NoopShareService, ShareService};
pub use synchronizer::{
    SyncConfig, SyncContext, SyncOptions, SyncStep, Synchronizer, MAX_RESOURCE_SIZE_MOBILE,
};
pub use uploader::ItemUploader;
