//! Local item database for the Quill notes application
//!
//! This crate provides:
//! - The polymorphic item model (notes, folders, resources, tags, note-tag
//!   links, revisions, master keys)
//! - The canonical text serialization exchanged with sync targets
//! - A SQLite-backed store with per-target sync metadata, pending-deletion
//!   tracking and resource blob fetch state

pub mod database;
pub mod errors;
pub mod item;
pub mod serializer;

pub use database::{
    AsyncItemStore, ChangeSource, DeletedItemRecord, NeedSyncBatch, SaveOptions, SyncItem,
};
pub use errors::{Result, StoreError};
pub use item::{
    item_id_from_system_path, new_item_id, resource_blob_path, system_path_for_id, unix_ms,
    FetchStatus, Item, ItemType, CONFLICT_FOLDER_ID, CONFLICT_FOLDER_TITLE,
};
pub use serializer::{deserialize_item, serialize_item};
