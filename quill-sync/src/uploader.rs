//! Serialization and upload of items to the target
//!
//! When the backend supports batched uploads, never-synced items are
//! pre-serialized and shipped in one request; per-item outcomes are memoized
//! so the subsequent singular upload call resolves from cache.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use quill_files::{FileApi, FileApiError, MultiPutItem, PutContent};
use quill_store::{serialize_item, Item};

use crate::errors::Result;

const MAX_BATCH_ITEMS: usize = 100;
const MAX_BATCH_BYTES: usize = 1_000_000;

pub struct ItemUploader {
    api: Arc<dyn FileApi>,
    /// path -> rejection reason (`None` = uploaded fine).
    preloaded: HashMap<String, Option<String>>,
}

impl ItemUploader {
    pub fn new(api: Arc<dyn FileApi>) -> Self {
        Self {
            api,
            preloaded: HashMap::new(),
        }
    }

    /// Batch-upload small items ahead of the per-item loop. No-op on
    /// backends without multi-put.
    pub async fn pre_upload_items(&mut self, items: &[&Item]) -> Result<()> {
        if !self.api.supports_multi_put() || items.is_empty() {
            return Ok(());
        }

        let mut batch: Vec<MultiPutItem> = Vec::new();
        let mut batch_bytes = 0usize;
        for item in items {
            let body = serialize_item(item);
            if !batch.is_empty()
                && (batch.len() >= MAX_BATCH_ITEMS || batch_bytes + body.len() > MAX_BATCH_BYTES)
            {
                self.flush_batch(std::mem::take(&mut batch)).await?;
                batch_bytes = 0;
            }
            batch_bytes += body.len();
            batch.push(MultiPutItem {
                path: item.system_path(),
                body,
            });
        }
        if !batch.is_empty() {
            self.flush_batch(batch).await?;
        }
        Ok(())
    }

    async fn flush_batch(&mut self, batch: Vec<MultiPutItem>) -> Result<()> {
        debug!("Pre-uploading {} items", batch.len());
        let responses = self.api.multi_put(batch).await?;
        for response in responses {
            self.preloaded.insert(response.path, response.error);
        }
        Ok(())
    }

    /// Upload one item's metadata, resolving from the pre-upload cache when
    /// possible. Target refusals surface as
    /// [`FileApiError::RejectedByTarget`].
    pub async fn serialize_and_upload_item(&mut self, item: &Item) -> Result<()> {
        let path = item.system_path();

        if let Some(outcome) = self.preloaded.remove(&path) {
            return match outcome {
                None => Ok(()),
                Some(reason) => Err(FileApiError::RejectedByTarget { path, reason }.into()),
            };
        }

        let body = serialize_item(item);
        self.api
            .put(&path, PutContent::Bytes(Bytes::from(body)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncError;
    use quill_files::MemoryFileApi;

    #[tokio::test]
    async fn test_upload_without_multi_put() {
        let api = Arc::new(MemoryFileApi::new(1));
        let mut uploader = ItemUploader::new(api.clone());
        let note = Item::new_note("t", "b", "");

        uploader.serialize_and_upload_item(&note).await.unwrap();
        assert!(api.get(&note.system_path()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pre_upload_memoizes_results() {
        let api = Arc::new(MemoryFileApi::new(1).with_multi_put(true));
        let mut uploader = ItemUploader::new(api.clone());
        let a = Item::new_note("a", "", "");
        let b = Item::new_note("b", "", "");

        uploader.pre_upload_items(&[&a, &b]).await.unwrap();
        assert_eq!(api.object_count(), 2);

        // Resolves from cache without another put.
        let requests_before = api.last_requests().len();
        uploader.serialize_and_upload_item(&a).await.unwrap();
        assert_eq!(api.last_requests().len(), requests_before);
    }

    #[tokio::test]
    async fn test_pre_upload_rejection_replayed_per_item() {
        let api = Arc::new(MemoryFileApi::new(1).with_multi_put(true));
        api.set_max_item_size(Some(300));
        let mut uploader = ItemUploader::new(api.clone());

        let small = Item::new_note("", "", "");
        let big = Item::new_note("", "x".repeat(500), "");
        uploader.pre_upload_items(&[&small, &big]).await.unwrap();

        uploader.serialize_and_upload_item(&small).await.unwrap();
        let err = uploader.serialize_and_upload_item(&big).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Files(FileApiError::RejectedByTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_pre_upload_noop_without_support() {
        let api = Arc::new(MemoryFileApi::new(1));
        let mut uploader = ItemUploader::new(api.clone());
        let note = Item::new_note("t", "", "");
        uploader.pre_upload_items(&[&note]).await.unwrap();
        assert_eq!(api.object_count(), 0);
    }
}
