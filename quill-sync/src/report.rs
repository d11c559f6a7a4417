//! Progress tracking for sync runs

use serde::Serialize;

/// What a sync run decided to do with one item. Exhaustive matching keeps
/// every handler accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    CreateLocal,
    UpdateLocal,
    DeleteLocal,
    CreateRemote,
    UpdateRemote,
    DeleteRemote,
    ItemConflict,
    NoteConflict,
    ResourceConflict,
}

/// Overall run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunState {
    #[default]
    Idle,
    InProgress,
}

/// Running counters for one sync run. Snapshots are delivered to
/// subscribers by value; cloning also clones the errors list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressReport {
    pub state: SyncRunState,
    pub create_local: i64,
    pub update_local: i64,
    pub delete_local: i64,
    pub create_remote: i64,
    pub update_remote: i64,
    pub delete_remote: i64,
    pub item_conflict: i64,
    pub note_conflict: i64,
    pub resource_conflict: i64,
    pub fetching_total: i64,
    pub fetching_processed: i64,
    pub cancelling: bool,
    pub start_time: i64,
    pub completed_time: Option<i64>,
    pub errors: Vec<String>,
}

impl ProgressReport {
    pub fn new(start_time: i64) -> Self {
        Self {
            state: SyncRunState::InProgress,
            start_time,
            ..Default::default()
        }
    }

    pub fn increment(&mut self, action: SyncAction) {
        match action {
            SyncAction::CreateLocal => self.create_local += 1,
            SyncAction::UpdateLocal => self.update_local += 1,
            SyncAction::DeleteLocal => self.delete_local += 1,
            SyncAction::CreateRemote => self.create_remote += 1,
            SyncAction::UpdateRemote => self.update_remote += 1,
            SyncAction::DeleteRemote => self.delete_remote += 1,
            SyncAction::ItemConflict => self.item_conflict += 1,
            SyncAction::NoteConflict => self.note_conflict += 1,
            SyncAction::ResourceConflict => self.resource_conflict += 1,
        }
    }

    /// Total local and remote writes performed by the run. Zero means the
    /// run was a no-op.
    pub fn total_changes(&self) -> i64 {
        self.create_local
            + self.update_local
            + self.delete_local
            + self.create_remote
            + self.update_remote
            + self.delete_remote
    }

    /// Human-readable summary, one line per non-zero counter.
    pub fn to_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let counters = [
            ("Created local items", self.create_local),
            ("Updated local items", self.update_local),
            ("Deleted local items", self.delete_local),
            ("Created remote items", self.create_remote),
            ("Updated remote items", self.update_remote),
            ("Deleted remote items", self.delete_remote),
            ("Item conflicts", self.item_conflict),
            ("Note conflicts", self.note_conflict),
            ("Resource conflicts", self.resource_conflict),
        ];
        for (label, value) in counters {
            if value > 0 {
                lines.push(format!("{}: {}", label, value));
            }
        }
        if self.fetching_total > 0 {
            lines.push(format!(
                "Fetched items: {}/{}",
                self.fetching_processed, self.fetching_total
            ));
        }
        if self.cancelling {
            lines.push("Cancelling...".to_string());
        }
        for error in &self.errors {
            lines.push(format!("Error: {}", error));
        }
        lines
    }
}
