//! Domain events dispatched by the synchronizer

use tokio::sync::broadcast;

use crate::report::ProgressReport;

/// Events fanned out to subscribers during a sync run.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started,
    ReportUpdate(ProgressReport),
    HasDisabledSyncItems,
    GotEncryptedItem,
    CreatedOrUpdatedResource { id: String },
    Completed { is_full_sync: bool, with_errors: bool },
}

/// Broadcast bus decoupling the engine from any UI framework. Dispatch is
/// fire-and-forget: events sent with no subscribers are dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn dispatch(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
