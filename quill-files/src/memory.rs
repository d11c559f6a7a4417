//! In-memory reference backend
//!
//! Used by the test suite and as the behavioral reference for drivers. Two
//! delta modes are supported: a native change log (the backend records every
//! write) and basic delta (the driver diffs a full listing against the
//! client's known id set, the way dumb blob stores have to).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{
    DeltaOptions, DeltaPage, FileApi, MultiPutItem, MultiPutResponse, PutContent, RemoteItem,
    RequestLogEntry,
};
use crate::errors::{FileApiError, Result};

const REQUEST_LOG_CAP: usize = 100;

/// Remote deletions above this share of the known id set trip the fail-safe.
const FAIL_SAFE_DELETION_RATIO: f64 = 0.90;

fn unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    content: Bytes,
    updated_time: i64,
    jop_updated_time: Option<i64>,
}

#[derive(Debug, Clone)]
struct NativeChange {
    counter: u64,
    path: String,
}

#[derive(Default)]
struct MemoryInner {
    entries: BTreeMap<String, MemoryEntry>,
    changes: Vec<NativeChange>,
    change_counter: u64,
    temp_dir_name: String,
    requests: VecDeque<RequestLogEntry>,
    max_item_size: Option<usize>,
    get_timeouts: std::collections::HashSet<String>,
}

impl MemoryInner {
    fn log(&mut self, op: &'static str, path: &str) {
        if self.requests.len() == REQUEST_LOG_CAP {
            self.requests.pop_front();
        }
        self.requests.push_back(RequestLogEntry {
            op,
            path: path.to_string(),
        });
    }

    fn record_change(&mut self, path: &str) {
        self.change_counter += 1;
        self.changes.push(NativeChange {
            counter: self.change_counter,
            path: path.to_string(),
        });
    }

    fn write(&mut self, path: &str, content: Bytes, accurate: bool) -> Result<()> {
        if let Some(max) = self.max_item_size {
            if content.len() > max {
                return Err(FileApiError::RejectedByTarget {
                    path: path.to_string(),
                    reason: format!("payload exceeds {} bytes", max),
                });
            }
        }
        let jop = if accurate {
            parse_client_updated_time(&content)
        } else {
            None
        };
        self.entries.insert(
            path.to_string(),
            MemoryEntry {
                content,
                updated_time: unix_ms(),
                jop_updated_time: jop,
            },
        );
        self.record_change(path);
        Ok(())
    }
}

/// Scan the canonical payload for the client-assigned `updated_time`
/// metadata line. Backends that index item metadata echo this in listings.
fn parse_client_updated_time(content: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(content).ok()?;
    for line in text.lines().rev() {
        if let Some(value) = line.strip_prefix("updated_time: ") {
            return value.parse().ok();
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatEntry {
    path: String,
    updated_time: i64,
    jop_updated_time: Option<i64>,
}

/// Continuation state of the basic-delta walk. `stats_cache` and
/// `pending_deletions` are derived and safe to drop between runs; the engine
/// strips them before persisting the context.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BasicDeltaContext {
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    processed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stats_cache: Option<Vec<StatEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_deletions: Option<Vec<String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NativeDeltaContext {
    #[serde(default)]
    cursor: u64,
}

/// In-memory [`FileApi`] implementation.
pub struct MemoryFileApi {
    inner: Mutex<MemoryInner>,
    sync_target_id: i32,
    accurate_timestamp: bool,
    multi_put: bool,
    native_delta: bool,
    delta_page_size: usize,
}

impl MemoryFileApi {
    pub fn new(sync_target_id: i32) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            sync_target_id,
            accurate_timestamp: false,
            multi_put: false,
            native_delta: false,
            delta_page_size: 50,
        }
    }

    /// Advertise accurate `jop_updated_time` in listings.
    pub fn with_accurate_timestamp(mut self, value: bool) -> Self {
        self.accurate_timestamp = value;
        self
    }

    /// Advertise batched uploads.
    pub fn with_multi_put(mut self, value: bool) -> Self {
        self.multi_put = value;
        self
    }

    /// Use the native change log instead of basic delta.
    pub fn with_native_delta(mut self, value: bool) -> Self {
        self.native_delta = value;
        self
    }

    pub fn with_delta_page_size(mut self, size: usize) -> Self {
        self.delta_page_size = size.max(1);
        self
    }

    /// Reject puts above this payload size, as quota-limited targets do.
    pub fn set_max_item_size(&self, max: Option<usize>) {
        self.inner.lock().unwrap().max_item_size = max;
    }

    /// Number of stored objects, for assertions.
    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Make the next `get` of this path fail with a request timeout.
    pub fn inject_get_timeout(&self, path: &str) {
        self.inner
            .lock()
            .unwrap()
            .get_timeouts
            .insert(path.to_string());
    }

    fn basic_delta(
        &self,
        inner: &mut MemoryInner,
        mut ctx: BasicDeltaContext,
        known_ids: Option<Vec<String>>,
        wipe_out_fail_safe: bool,
    ) -> Result<DeltaPage> {
        if ctx.stats_cache.is_none() {
            let mut stats: Vec<StatEntry> = inner
                .entries
                .iter()
                .filter(|(path, entry)| {
                    entry.updated_time > ctx.timestamp
                        || (entry.updated_time == ctx.timestamp
                            && !ctx.processed.contains(*path))
                })
                .map(|(path, entry)| StatEntry {
                    path: path.clone(),
                    updated_time: entry.updated_time,
                    jop_updated_time: entry.jop_updated_time,
                })
                .collect();
            stats.sort_by(|a, b| {
                a.updated_time
                    .cmp(&b.updated_time)
                    .then_with(|| a.path.cmp(&b.path))
            });
            ctx.stats_cache = Some(stats);

            if let Some(ids) = known_ids {
                let deleted: Vec<String> = ids
                    .iter()
                    .filter(|id| !inner.entries.contains_key(&format!("{}.md", id)))
                    .map(|id| format!("{}.md", id))
                    .collect();
                if wipe_out_fail_safe
                    && !ids.is_empty()
                    && deleted.len() as f64 / ids.len() as f64 >= FAIL_SAFE_DELETION_RATIO
                {
                    return Err(FileApiError::FailSafe);
                }
                ctx.pending_deletions = Some(deleted);
            }
        }

        let mut stats = ctx.stats_cache.take().unwrap_or_default();
        let take = stats.len().min(self.delta_page_size);
        let page_stats: Vec<StatEntry> = stats.drain(..take).collect();

        let mut items: Vec<RemoteItem> = page_stats
            .iter()
            .map(|s| RemoteItem {
                path: s.path.clone(),
                updated_time: s.updated_time,
                jop_updated_time: s.jop_updated_time,
                is_deleted: false,
                is_dir: false,
            })
            .collect();

        if let Some(last) = page_stats.last() {
            if last.updated_time != ctx.timestamp {
                ctx.processed.clear();
            }
            ctx.timestamp = last.updated_time;
            ctx.processed.extend(
                page_stats
                    .iter()
                    .filter(|s| s.updated_time == ctx.timestamp)
                    .map(|s| s.path.clone()),
            );
        }

        let mut pending_deletions = ctx.pending_deletions.take().unwrap_or_default();
        if stats.is_empty() && !pending_deletions.is_empty() {
            items.extend(pending_deletions.drain(..).map(|path| RemoteItem {
                path,
                updated_time: 0,
                jop_updated_time: None,
                is_deleted: true,
                is_dir: false,
            }));
        }

        let has_more = !stats.is_empty() || !pending_deletions.is_empty();
        if has_more {
            ctx.stats_cache = Some(stats);
            ctx.pending_deletions = Some(pending_deletions);
        } else {
            // The walk is complete; the next delta call starts a fresh
            // listing from the recorded timestamp.
            ctx.stats_cache = None;
            ctx.pending_deletions = None;
        }

        Ok(DeltaPage {
            items,
            context: serde_json::to_value(&ctx)?,
            has_more,
        })
    }

    fn native_delta_page(
        &self,
        inner: &mut MemoryInner,
        ctx: NativeDeltaContext,
    ) -> Result<DeltaPage> {
        let mut cursor = ctx.cursor;
        let mut paths: Vec<String> = Vec::new();
        for change in inner.changes.iter().filter(|c| c.counter > ctx.cursor) {
            if !paths.contains(&change.path) {
                if paths.len() == self.delta_page_size {
                    break;
                }
                paths.push(change.path.clone());
            }
            cursor = change.counter;
        }

        let items: Vec<RemoteItem> = paths
            .into_iter()
            .map(|path| match inner.entries.get(&path) {
                Some(entry) => RemoteItem {
                    path,
                    updated_time: entry.updated_time,
                    jop_updated_time: entry.jop_updated_time,
                    is_deleted: false,
                    is_dir: false,
                },
                None => RemoteItem {
                    path,
                    updated_time: 0,
                    jop_updated_time: None,
                    is_deleted: true,
                    is_dir: false,
                },
            })
            .collect();

        let has_more = inner.changes.iter().any(|c| c.counter > cursor);
        Ok(DeltaPage {
            items,
            context: serde_json::to_value(NativeDeltaContext { cursor })?,
            has_more,
        })
    }
}

#[async_trait]
impl FileApi for MemoryFileApi {
    async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.log("initialize", "");
        Ok(())
    }

    fn set_temp_dir_name(&self, name: &str) {
        self.inner.lock().unwrap().temp_dir_name = name.to_string();
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteItem>> {
        let mut inner = self.inner.lock().unwrap();
        inner.log("stat", path);
        Ok(inner.entries.get(path).map(|entry| RemoteItem {
            path: path.to_string(),
            updated_time: entry.updated_time,
            jop_updated_time: entry.jop_updated_time,
            is_deleted: false,
            is_dir: false,
        }))
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock().unwrap();
        inner.log("get", path);
        if inner.get_timeouts.remove(path) {
            return Err(FileApiError::Timeout(format!("request timeout: {}", path)));
        }
        Ok(inner.entries.get(path).map(|e| e.content.clone()))
    }

    async fn put(&self, path: &str, content: PutContent) -> Result<()> {
        let bytes = match content {
            PutContent::Bytes(bytes) => bytes,
            PutContent::LocalFile { path: local, .. } => {
                Bytes::from(tokio::fs::read(&local).await?)
            }
        };
        let mut inner = self.inner.lock().unwrap();
        inner.log("put", path);
        inner.write(path, bytes, self.accurate_timestamp)?;
        debug!("put {} ({} bytes)", path, inner.entries[path].content.len());
        Ok(())
    }

    async fn multi_put(&self, items: Vec<MultiPutItem>) -> Result<Vec<MultiPutResponse>> {
        let mut inner = self.inner.lock().unwrap();
        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            inner.log("multiPut", &item.path);
            let outcome = inner.write(
                &item.path,
                Bytes::from(item.body.into_bytes()),
                self.accurate_timestamp,
            );
            responses.push(MultiPutResponse {
                path: item.path,
                error: outcome.err().map(|e| e.to_string()),
            });
        }
        Ok(responses)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.log("delete", path);
        if inner.entries.remove(path).is_some() {
            inner.record_change(path);
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<RemoteItem>> {
        let mut inner = self.inner.lock().unwrap();
        inner.log("list", path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let mut out = Vec::new();
        for (entry_path, entry) in &inner.entries {
            let Some(rest) = entry_path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            out.push(RemoteItem {
                path: rest.to_string(),
                updated_time: entry.updated_time,
                jop_updated_time: entry.jop_updated_time,
                is_deleted: false,
                is_dir: false,
            });
        }
        Ok(out)
    }

    async fn delta(&self, path: &str, options: DeltaOptions<'_>) -> Result<DeltaPage> {
        // Resolve the id set before taking the lock: the handler hits the
        // item store.
        let known_ids = if !self.native_delta {
            match options.all_item_ids {
                Some(source) => Some(source.synced_item_ids().await?),
                None => None,
            }
        } else {
            None
        };

        let mut inner = self.inner.lock().unwrap();
        inner.log("delta", path);

        if self.native_delta {
            let ctx: NativeDeltaContext = match options.context {
                Some(value) => serde_json::from_value(value)
                    .map_err(|e| FileApiError::BadContext(e.to_string()))?,
                None => NativeDeltaContext::default(),
            };
            self.native_delta_page(&mut inner, ctx)
        } else {
            let ctx: BasicDeltaContext = match options.context {
                Some(value) => serde_json::from_value(value)
                    .map_err(|e| FileApiError::BadContext(e.to_string()))?,
                None => BasicDeltaContext::default(),
            };
            self.basic_delta(&mut inner, ctx, known_ids, options.wipe_out_fail_safe)
        }
    }

    fn sync_target_id(&self) -> i32 {
        self.sync_target_id
    }

    fn supports_accurate_timestamp(&self) -> bool {
        self.accurate_timestamp
    }

    fn supports_multi_put(&self) -> bool {
        self.multi_put
    }

    fn last_requests(&self) -> Vec<RequestLogEntry> {
        self.inner.lock().unwrap().requests.iter().cloned().collect()
    }
}
