//! Item model shared by the store and the sync engine
//!
//! Every persisted object is an `Item`: a flat record with a type
//! discriminator and a superset of the per-variant columns. This mirrors the
//! single-table layout of the local database and keeps serialization uniform.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};

/// Parent folder id given to conflict copies. The folder itself is local-only
/// and never uploaded (it is flagged `is_conflict`).
pub const CONFLICT_FOLDER_ID: &str = "cf000000000000000000000000000000";

/// Title of the local-only folder holding conflict copies.
pub const CONFLICT_FOLDER_TITLE: &str = "Conflicts";

/// Item variant discriminator. Stored as an integer column and serialized as
/// the trailing `type_` metadata line of the canonical payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    Folder = 1,
    Note = 2,
    Resource = 3,
    Tag = 4,
    NoteTag = 5,
    Revision = 6,
    MasterKey = 7,
}

impl ItemType {
    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            1 => Ok(ItemType::Folder),
            2 => Ok(ItemType::Note),
            3 => Ok(ItemType::Resource),
            4 => Ok(ItemType::Tag),
            5 => Ok(ItemType::NoteTag),
            6 => Ok(ItemType::Revision),
            7 => Ok(ItemType::MasterKey),
            other => Err(StoreError::UnknownItemType(other)),
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Fetch state of a resource blob on this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    Idle = 0,
    Started = 1,
    Done = 2,
    Error = 3,
}

impl FetchStatus {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => FetchStatus::Started,
            2 => FetchStatus::Done,
            3 => FetchStatus::Error,
            _ => FetchStatus::Idle,
        }
    }
}

/// A single item row. Variant-specific fields keep their zero value for other
/// variants, the same way the database columns default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub item_type: ItemType,
    pub parent_id: String,
    pub title: String,
    pub body: String,
    pub created_time: i64,
    pub updated_time: i64,
    pub user_created_time: i64,
    pub user_updated_time: i64,
    pub encryption_applied: bool,
    pub share_id: String,
    pub is_conflict: bool,
    pub conflict_original_id: String,
    /// Notes: completion timestamp for todos, 0 when unset.
    pub todo_completed: i64,
    /// Resources: blob size in bytes.
    pub size: i64,
    /// Resources: mime type.
    pub mime: String,
    /// Resources: original file name.
    pub filename: String,
    /// NoteTags: the linked note.
    pub note_id: String,
    /// NoteTags: the linked tag.
    pub tag_id: String,
    /// Revisions: the item this revision belongs to.
    pub rev_item_id: String,
    /// MasterKeys: opaque key material.
    pub master_key_data: String,
}

/// Generate a new item id: 32 lowercase hex chars.
pub fn new_item_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current wall-clock time as a millisecond epoch. All item timestamps are
/// client-assigned milliseconds.
pub fn unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Item {
    /// Create an empty item of the given type with fresh id and timestamps.
    pub fn new(item_type: ItemType) -> Self {
        let now = unix_ms();
        Self {
            id: new_item_id(),
            item_type,
            parent_id: String::new(),
            title: String::new(),
            body: String::new(),
            created_time: now,
            updated_time: now,
            user_created_time: now,
            user_updated_time: now,
            encryption_applied: false,
            share_id: String::new(),
            is_conflict: false,
            conflict_original_id: String::new(),
            todo_completed: 0,
            size: 0,
            mime: String::new(),
            filename: String::new(),
            note_id: String::new(),
            tag_id: String::new(),
            rev_item_id: String::new(),
            master_key_data: String::new(),
        }
    }

    pub fn new_folder(title: impl Into<String>) -> Self {
        let mut item = Self::new(ItemType::Folder);
        item.title = title.into();
        item
    }

    pub fn new_note(title: impl Into<String>, body: impl Into<String>, parent_id: impl Into<String>) -> Self {
        let mut item = Self::new(ItemType::Note);
        item.title = title.into();
        item.body = body.into();
        item.parent_id = parent_id.into();
        item
    }

    pub fn new_resource(filename: impl Into<String>, mime: impl Into<String>, size: i64) -> Self {
        let mut item = Self::new(ItemType::Resource);
        item.filename = filename.into();
        item.mime = mime.into();
        item.size = size;
        item
    }

    pub fn new_tag(title: impl Into<String>) -> Self {
        let mut item = Self::new(ItemType::Tag);
        item.title = title.into();
        item
    }

    pub fn new_master_key(key_data: impl Into<String>) -> Self {
        let mut item = Self::new(ItemType::MasterKey);
        item.master_key_data = key_data.into();
        item
    }

    /// Remote path of the item's metadata file.
    pub fn system_path(&self) -> String {
        system_path_for_id(&self.id)
    }

    /// Duplicate this item as a conflict copy: fresh id, parented under the
    /// Conflicts folder, pointing back at the original.
    pub fn to_conflict_copy(&self) -> Item {
        let mut copy = self.clone();
        copy.id = new_item_id();
        copy.is_conflict = true;
        copy.conflict_original_id = self.id.clone();
        copy.parent_id = CONFLICT_FOLDER_ID.to_string();
        copy
    }
}

/// Remote metadata path for an item id.
pub fn system_path_for_id(id: &str) -> String {
    format!("{}.md", id)
}

/// Remote path of a resource blob.
pub fn resource_blob_path(resource_id: &str) -> String {
    format!("Resources/{}", resource_id)
}

/// Extract the item id from a remote path, if the path names a managed item.
/// Lock files, the version file, resource blobs and directories are not
/// system paths.
pub fn item_id_from_system_path(path: &str) -> Option<&str> {
    let id = path.strip_suffix(".md")?;
    if id.len() != 32 || id.contains('/') {
        return None;
    }
    if !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_id_shape() {
        let id = new_item_id();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_system_path_round_trip() {
        let note = Item::new_note("a", "b", "");
        let path = note.system_path();
        assert_eq!(item_id_from_system_path(&path), Some(note.id.as_str()));
    }

    #[test]
    fn test_non_system_paths_rejected() {
        assert_eq!(item_id_from_system_path(".sync/version.txt"), None);
        assert_eq!(item_id_from_system_path("info.json"), None);
        assert_eq!(item_id_from_system_path("Resources/abc"), None);
        assert_eq!(item_id_from_system_path("short.md"), None);
        assert_eq!(
            item_id_from_system_path("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz.md"),
            None
        );
    }

    #[test]
    fn test_conflict_copy() {
        let note = Item::new_note("title", "body", "folder-1");
        let copy = note.to_conflict_copy();
        assert_ne!(copy.id, note.id);
        assert!(copy.is_conflict);
        assert_eq!(copy.conflict_original_id, note.id);
        assert_eq!(copy.parent_id, CONFLICT_FOLDER_ID);
        assert_eq!(copy.body, note.body);
    }
}
