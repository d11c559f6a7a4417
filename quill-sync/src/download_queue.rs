//! Bounded-concurrency fetch queue for the delta phase
//!
//! Jobs are keyed by remote path, started eagerly under a concurrency bound
//! and memoized until consumed, so the processing loop can enqueue a whole
//! page of downloads and then finalize items in list order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use quill_files::FileApiError;

/// Outcome of one fetch: content bytes, absent remote, or a transport error.
pub type FetchResult = std::result::Result<Option<Bytes>, FileApiError>;

enum JobState {
    Running(JoinHandle<FetchResult>),
    Done(FetchResult),
}

pub struct DownloadQueue {
    jobs: Mutex<HashMap<String, JobState>>,
    semaphore: Arc<Semaphore>,
    stopped: AtomicBool,
}

impl DownloadQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            stopped: AtomicBool::new(false),
        }
    }

    /// Schedule a fetch under the concurrency bound. Duplicate keys and
    /// pushes after [`DownloadQueue::stop`] are ignored.
    pub fn push<F>(&self, key: &str, fetch: F)
    where
        F: Future<Output = FetchResult> + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(key) {
            return;
        }

        let semaphore = self.semaphore.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| FileApiError::Internal("download queue closed".to_string()))?;
            fetch.await
        });
        jobs.insert(key.to_string(), JobState::Running(handle));
    }

    /// Await and consume the result for a key. Returns `None` when nothing
    /// was scheduled under that key.
    pub async fn wait_for_result(&self, key: &str) -> Option<FetchResult> {
        let state = self.jobs.lock().unwrap().remove(key)?;
        match state {
            JobState::Done(result) => Some(result),
            JobState::Running(handle) => Some(handle.await.unwrap_or_else(|e| {
                Err(FileApiError::Internal(format!("download task failed: {}", e)))
            })),
        }
    }

    /// Halt new scheduling. Fetches already issued run to completion and
    /// their results remain consumable.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Download queue stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
