//! The file API contract every sync target backend satisfies
//!
//! Backends expose flat blob storage over string paths plus a paginated
//! delta feed. Feature flags advertise capabilities the engine can exploit
//! (accurate item timestamps in listings, batched uploads).

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Metadata of a remote object as returned by stat/list/delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub path: String,
    /// Wall-clock mtime on the target, milliseconds. May drift from the
    /// client-assigned item timestamp.
    pub updated_time: i64,
    /// The client-assigned `updated_time` echoed by the target. Only present
    /// when the backend advertises accurate timestamps.
    pub jop_updated_time: Option<i64>,
    pub is_deleted: bool,
    pub is_dir: bool,
}

/// Payload for a put: inline bytes or a stream from a local file.
#[derive(Debug, Clone)]
pub enum PutContent {
    Bytes(Bytes),
    LocalFile {
        path: PathBuf,
        share_id: Option<String>,
    },
}

/// One entry of a batched upload.
#[derive(Debug, Clone)]
pub struct MultiPutItem {
    pub path: String,
    pub body: String,
}

/// Per-item outcome of a batched upload.
#[derive(Debug, Clone)]
pub struct MultiPutResponse {
    pub path: String,
    /// Rejection reason, `None` on success.
    pub error: Option<String>,
}

/// One page of the delta feed.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub items: Vec<RemoteItem>,
    /// Opaque continuation to pass back on the next call.
    pub context: serde_json::Value,
    pub has_more: bool,
}

/// Supplies the client's known synced item ids. Only consulted by backends
/// without a native change feed, which diff the id set against their listing
/// to detect remote deletions.
#[async_trait]
pub trait ItemIdSource: Send + Sync {
    async fn synced_item_ids(&self) -> Result<Vec<String>>;
}

/// Options for a delta call.
pub struct DeltaOptions<'a> {
    pub context: Option<serde_json::Value>,
    pub all_item_ids: Option<&'a dyn ItemIdSource>,
    /// Abort with [`FileApiError::FailSafe`] when the driver would report a
    /// suspiciously large set of deletions.
    pub wipe_out_fail_safe: bool,
}

/// Diagnostics entry for the recent-request buffer.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub op: &'static str,
    pub path: String,
}

/// The abstraction every storage backend must satisfy.
#[async_trait]
pub trait FileApi: Send + Sync {
    /// Idempotent setup; creates directory scaffolding.
    async fn initialize(&self) -> Result<()>;

    /// Configure the scratch directory name under the target root.
    fn set_temp_dir_name(&self, name: &str);

    /// Metadata of a remote object, `None` if absent.
    async fn stat(&self, path: &str) -> Result<Option<RemoteItem>>;

    /// Serialized content, `None` if absent.
    async fn get(&self, path: &str) -> Result<Option<Bytes>>;

    /// Write content, inline or streamed from a local file.
    async fn put(&self, path: &str, content: PutContent) -> Result<()>;

    /// Batched upload. Only meaningful when [`FileApi::supports_multi_put`].
    async fn multi_put(&self, items: Vec<MultiPutItem>) -> Result<Vec<MultiPutResponse>>;

    /// Remove a remote object; idempotent on missing.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Direct children of a directory, paths relative to it.
    async fn list(&self, path: &str) -> Result<Vec<RemoteItem>>;

    /// Paginated change feed with opaque continuation.
    async fn delta(&self, path: &str, options: DeltaOptions<'_>) -> Result<DeltaPage>;

    /// Stable identifier of this backend.
    fn sync_target_id(&self) -> i32;

    /// Whether `jop_updated_time` in listing output is authoritative.
    fn supports_accurate_timestamp(&self) -> bool;

    /// Whether batched uploads are available.
    fn supports_multi_put(&self) -> bool;

    /// Recent requests, oldest first.
    fn last_requests(&self) -> Vec<RequestLogEntry>;
}
