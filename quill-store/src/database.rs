//! Persistent item database
//!
//! One table holds every item variant; companion tables track per-target sync
//! metadata, pending remote deletions and resource blob fetch state.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::Result;
use crate::item::{
    unix_ms, FetchStatus, Item, ItemType, CONFLICT_FOLDER_ID, CONFLICT_FOLDER_TITLE,
};

/// Who produced a change. Sync-sourced writes are not queued for upload
/// again because the sync time is recorded in the same call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Sync,
}

/// Options for [`AsyncItemStore::save_item`].
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Bump `updated_time`/`user_updated_time` to now. Disabled for
    /// sync-sourced writes, which must keep the remote timestamps.
    pub auto_timestamp: bool,
    pub change_source: ChangeSource,
    /// Record `(sync_target_id, sync_time)` in the same store call.
    pub sync_time: Option<(i32, i64)>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            auto_timestamp: true,
            change_source: ChangeSource::Local,
            sync_time: None,
        }
    }
}

impl SaveOptions {
    /// Options for materializing a remote item locally.
    pub fn from_sync(sync_target_id: i32, sync_time: i64) -> Self {
        Self {
            auto_timestamp: false,
            change_source: ChangeSource::Sync,
            sync_time: Some((sync_target_id, sync_time)),
        }
    }
}

/// Per (target, item) sync metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncItem {
    pub sync_target_id: i32,
    pub item_id: String,
    pub sync_time: i64,
    pub sync_disabled: bool,
    pub sync_disabled_reason: String,
}

/// A local deletion waiting to be propagated to a target.
#[derive(Debug, Clone)]
pub struct DeletedItemRecord {
    pub id: i64,
    pub item_id: String,
    pub item_type: ItemType,
    pub sync_target_id: i32,
}

/// One batch of items that need uploading.
#[derive(Debug, Clone, Default)]
pub struct NeedSyncBatch {
    pub items: Vec<Item>,
    pub has_more: bool,
    /// Subset of `items` that was never uploaded to this target.
    pub never_synced_ids: HashSet<String>,
}

/// Synchronous database over a single SQLite connection.
/// Note: shared through the async wrapper below, which serializes access.
struct ItemDatabase {
    conn: Connection,
}

// SQLite connections can be shared if we use proper synchronization.
unsafe impl Send for ItemDatabase {}
unsafe impl Sync for ItemDatabase {}

/// Async-safe handle to the item database.
#[derive(Clone)]
pub struct AsyncItemStore {
    inner: Arc<RwLock<ItemDatabase>>,
}

impl ItemDatabase {
    fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                item_type INTEGER NOT NULL,
                parent_id TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                created_time INTEGER NOT NULL,
                updated_time INTEGER NOT NULL,
                user_created_time INTEGER NOT NULL,
                user_updated_time INTEGER NOT NULL,
                encryption_applied INTEGER NOT NULL DEFAULT 0,
                share_id TEXT NOT NULL DEFAULT '',
                is_conflict INTEGER NOT NULL DEFAULT 0,
                conflict_original_id TEXT NOT NULL DEFAULT '',
                todo_completed INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                mime TEXT NOT NULL DEFAULT '',
                filename TEXT NOT NULL DEFAULT '',
                note_id TEXT NOT NULL DEFAULT '',
                tag_id TEXT NOT NULL DEFAULT '',
                rev_item_id TEXT NOT NULL DEFAULT '',
                master_key_data TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS sync_items (
                sync_target_id INTEGER NOT NULL,
                item_id TEXT NOT NULL,
                sync_time INTEGER NOT NULL DEFAULT 0,
                sync_disabled INTEGER NOT NULL DEFAULT 0,
                sync_disabled_reason TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (sync_target_id, item_id)
            );

            CREATE TABLE IF NOT EXISTS deleted_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL,
                item_type INTEGER NOT NULL,
                sync_target_id INTEGER NOT NULL,
                deleted_time INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resource_local_states (
                resource_id TEXT PRIMARY KEY,
                fetch_status INTEGER NOT NULL DEFAULT 0,
                fetch_error TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_items_parent ON items(parent_id);
            CREATE INDEX IF NOT EXISTS idx_items_updated ON items(updated_time);
            CREATE INDEX IF NOT EXISTS idx_deleted_items_target ON deleted_items(sync_target_id);
            "#,
        )?;

        info!("Item database initialized");
        Ok(())
    }

    fn row_to_item(row: &Row<'_>) -> rusqlite::Result<Item> {
        let type_raw: i64 = row.get(1)?;
        Ok(Item {
            id: row.get(0)?,
            item_type: ItemType::from_i64(type_raw).unwrap_or(ItemType::Note),
            parent_id: row.get(2)?,
            title: row.get(3)?,
            body: row.get(4)?,
            created_time: row.get(5)?,
            updated_time: row.get(6)?,
            user_created_time: row.get(7)?,
            user_updated_time: row.get(8)?,
            encryption_applied: row.get::<_, i64>(9)? != 0,
            share_id: row.get(10)?,
            is_conflict: row.get::<_, i64>(11)? != 0,
            conflict_original_id: row.get(12)?,
            todo_completed: row.get(13)?,
            size: row.get(14)?,
            mime: row.get(15)?,
            filename: row.get(16)?,
            note_id: row.get(17)?,
            tag_id: row.get(18)?,
            rev_item_id: row.get(19)?,
            master_key_data: row.get(20)?,
        })
    }

    const ITEM_COLUMNS: &'static str = "id, item_type, parent_id, title, body, created_time, \
        updated_time, user_created_time, user_updated_time, encryption_applied, share_id, \
        is_conflict, conflict_original_id, todo_completed, size, mime, filename, note_id, \
        tag_id, rev_item_id, master_key_data";

    fn save_item(&mut self, item: &Item, options: &SaveOptions) -> Result<Item> {
        let mut item = item.clone();
        if options.auto_timestamp {
            let now = unix_ms();
            item.updated_time = now;
            item.user_updated_time = now;
        }

        self.conn.execute(
            r#"
            INSERT INTO items
                (id, item_type, parent_id, title, body, created_time, updated_time,
                 user_created_time, user_updated_time, encryption_applied, share_id,
                 is_conflict, conflict_original_id, todo_completed, size, mime, filename,
                 note_id, tag_id, rev_item_id, master_key_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21)
            ON CONFLICT(id) DO UPDATE SET
                item_type = excluded.item_type,
                parent_id = excluded.parent_id,
                title = excluded.title,
                body = excluded.body,
                created_time = excluded.created_time,
                updated_time = excluded.updated_time,
                user_created_time = excluded.user_created_time,
                user_updated_time = excluded.user_updated_time,
                encryption_applied = excluded.encryption_applied,
                share_id = excluded.share_id,
                is_conflict = excluded.is_conflict,
                conflict_original_id = excluded.conflict_original_id,
                todo_completed = excluded.todo_completed,
                size = excluded.size,
                mime = excluded.mime,
                filename = excluded.filename,
                note_id = excluded.note_id,
                tag_id = excluded.tag_id,
                rev_item_id = excluded.rev_item_id,
                master_key_data = excluded.master_key_data
            "#,
            params![
                item.id,
                item.item_type.as_i64(),
                item.parent_id,
                item.title,
                item.body,
                item.created_time,
                item.updated_time,
                item.user_created_time,
                item.user_updated_time,
                item.encryption_applied as i64,
                item.share_id,
                item.is_conflict as i64,
                item.conflict_original_id,
                item.todo_completed,
                item.size,
                item.mime,
                item.filename,
                item.note_id,
                item.tag_id,
                item.rev_item_id,
                item.master_key_data,
            ],
        )?;

        if let Some((target, sync_time)) = options.sync_time {
            self.save_sync_time(target, &item.id, sync_time)?;
        }

        debug!("Saved item {} ({:?})", item.id, options.change_source);
        Ok(item)
    }

    fn load_item(&self, id: &str) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE id = ?1", Self::ITEM_COLUMNS);
        let item = self
            .conn
            .query_row(&sql, params![id], Self::row_to_item)
            .optional()?;
        Ok(item)
    }

    fn delete_item(&mut self, id: &str, track_deleted: Option<i32>) -> Result<()> {
        let item = self.load_item(id)?;
        let Some(item) = item else {
            return Ok(());
        };

        self.conn
            .execute("DELETE FROM items WHERE id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM sync_items WHERE item_id = ?1", params![id])?;
        if item.item_type == ItemType::Resource {
            self.conn.execute(
                "DELETE FROM resource_local_states WHERE resource_id = ?1",
                params![id],
            )?;
        }

        if let Some(target) = track_deleted {
            self.conn.execute(
                r#"
                INSERT INTO deleted_items (item_id, item_type, sync_target_id, deleted_time)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![id, item.item_type.as_i64(), target, unix_ms()],
            )?;
        }

        debug!("Deleted item {} (tracked: {})", id, track_deleted.is_some());
        Ok(())
    }

    fn items_that_need_sync(&self, sync_target_id: i32, limit: usize) -> Result<NeedSyncBatch> {
        let sql = format!(
            r#"
            SELECT {}, COALESCE(s.sync_time, 0)
            FROM items i
            LEFT JOIN sync_items s
                ON s.item_id = i.id AND s.sync_target_id = ?1
            WHERE COALESCE(s.sync_time, 0) < i.updated_time
              AND COALESCE(s.sync_disabled, 0) = 0
              AND i.is_conflict = 0
            ORDER BY i.updated_time ASC
            LIMIT ?2
            "#,
            Self::ITEM_COLUMNS
                .split(", ")
                .map(|c| format!("i.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![sync_target_id, (limit + 1) as i64], |row| {
            let item = Self::row_to_item(row)?;
            let sync_time: i64 = row.get(21)?;
            Ok((item, sync_time))
        })?;

        let mut batch = NeedSyncBatch::default();
        for row in rows {
            let (item, sync_time) = row?;
            if batch.items.len() == limit {
                batch.has_more = true;
                break;
            }
            if sync_time == 0 {
                batch.never_synced_ids.insert(item.id.clone());
            }
            batch.items.push(item);
        }
        Ok(batch)
    }

    fn sync_item(&self, sync_target_id: i32, item_id: &str) -> Result<Option<SyncItem>> {
        let result = self
            .conn
            .query_row(
                r#"
                SELECT sync_target_id, item_id, sync_time, sync_disabled, sync_disabled_reason
                FROM sync_items
                WHERE sync_target_id = ?1 AND item_id = ?2
                "#,
                params![sync_target_id, item_id],
                |row| {
                    Ok(SyncItem {
                        sync_target_id: row.get(0)?,
                        item_id: row.get(1)?,
                        sync_time: row.get(2)?,
                        sync_disabled: row.get::<_, i64>(3)? != 0,
                        sync_disabled_reason: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Record a successful reconciliation. Also clears any disabled flag:
    /// an item that synced fine is no longer broken.
    fn save_sync_time(&mut self, sync_target_id: i32, item_id: &str, sync_time: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_items (sync_target_id, item_id, sync_time)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(sync_target_id, item_id) DO UPDATE SET
                sync_time = excluded.sync_time,
                sync_disabled = 0,
                sync_disabled_reason = ''
            "#,
            params![sync_target_id, item_id, sync_time],
        )?;
        Ok(())
    }

    fn set_sync_disabled(&mut self, sync_target_id: i32, item_id: &str, reason: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_items (sync_target_id, item_id, sync_disabled, sync_disabled_reason)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(sync_target_id, item_id) DO UPDATE SET
                sync_disabled = 1,
                sync_disabled_reason = excluded.sync_disabled_reason
            "#,
            params![sync_target_id, item_id, reason],
        )?;
        Ok(())
    }

    fn clear_sync_disabled(&mut self, sync_target_id: i32, item_id: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE sync_items SET sync_disabled = 0, sync_disabled_reason = ''
            WHERE sync_target_id = ?1 AND item_id = ?2
            "#,
            params![sync_target_id, item_id],
        )?;
        Ok(())
    }

    fn disabled_sync_item_count(&self, sync_target_id: i32) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_items WHERE sync_target_id = ?1 AND sync_disabled = 1",
            params![sync_target_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn deleted_item_records(&self, sync_target_id: i32) -> Result<Vec<DeletedItemRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, item_id, item_type, sync_target_id
            FROM deleted_items
            WHERE sync_target_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![sync_target_id], |row| {
            let type_raw: i64 = row.get(2)?;
            Ok(DeletedItemRecord {
                id: row.get(0)?,
                item_id: row.get(1)?,
                item_type: ItemType::from_i64(type_raw).unwrap_or(ItemType::Note),
                sync_target_id: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn remove_deleted_item_record(&mut self, record_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM deleted_items WHERE id = ?1", params![record_id])?;
        Ok(())
    }

    fn resource_fetch_status(&self, resource_id: &str) -> Result<FetchStatus> {
        let status: Option<i64> = self
            .conn
            .query_row(
                "SELECT fetch_status FROM resource_local_states WHERE resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.map(FetchStatus::from_i64).unwrap_or(FetchStatus::Idle))
    }

    fn set_resource_fetch_status(&mut self, resource_id: &str, status: FetchStatus) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO resource_local_states (resource_id, fetch_status)
            VALUES (?1, ?2)
            ON CONFLICT(resource_id) DO UPDATE SET fetch_status = excluded.fetch_status
            "#,
            params![resource_id, status as i64],
        )?;
        Ok(())
    }

    fn folder_note_ids(&self, folder_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM items WHERE parent_id = ?1 AND item_type = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![folder_id, ItemType::Note.as_i64()], |row| {
            row.get(0)
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn item_count(&self, item_type: ItemType) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM items WHERE item_type = ?1",
            params![item_type.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Ids of items that have completed at least one upload to the target.
    /// Used by basic-delta backends to detect remote deletions, which is why
    /// never-synced and conflict items must not appear here.
    fn synced_item_ids(&self, sync_target_id: i32) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT i.id FROM items i
            INNER JOIN sync_items s ON s.item_id = i.id AND s.sync_target_id = ?1
            WHERE s.sync_time > 0 AND i.is_conflict = 0
            ORDER BY i.id
            "#,
        )?;
        let rows = stmt.query_map(params![sync_target_id], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn purge_orphaned_sync_items(&mut self) -> Result<usize> {
        let purged = self.conn.execute(
            "DELETE FROM sync_items WHERE item_id NOT IN (SELECT id FROM items)",
            [],
        )?;
        if purged > 0 {
            debug!("Purged {} orphaned sync items", purged);
        }
        Ok(purged)
    }

    fn ensure_conflict_folder(&mut self) -> Result<()> {
        if self.load_item(CONFLICT_FOLDER_ID)?.is_some() {
            return Ok(());
        }
        let mut folder = Item::new_folder(CONFLICT_FOLDER_TITLE);
        folder.id = CONFLICT_FOLDER_ID.to_string();
        folder.is_conflict = true;
        self.save_item(
            &folder,
            &SaveOptions {
                auto_timestamp: false,
                change_source: ChangeSource::Local,
                sync_time: None,
            },
        )?;
        Ok(())
    }
}

impl AsyncItemStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = ItemDatabase::open(path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(db)),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let db = ItemDatabase::open_in_memory()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(db)),
        })
    }

    /// Save an item. Returns the stored row (timestamps may have been
    /// bumped when `auto_timestamp` is set).
    pub async fn save_item(&self, item: &Item, options: &SaveOptions) -> Result<Item> {
        let mut db = self.inner.write().await;
        db.save_item(item, options)
    }

    pub async fn load_item(&self, id: &str) -> Result<Option<Item>> {
        let db = self.inner.read().await;
        db.load_item(id)
    }

    /// Delete an item. `track_deleted` queues the deletion for upload to the
    /// given target; `None` is used for sync-sourced deletions.
    pub async fn delete_item(&self, id: &str, track_deleted: Option<i32>) -> Result<()> {
        let mut db = self.inner.write().await;
        db.delete_item(id, track_deleted)
    }

    pub async fn items_that_need_sync(
        &self,
        sync_target_id: i32,
        limit: usize,
    ) -> Result<NeedSyncBatch> {
        let db = self.inner.read().await;
        db.items_that_need_sync(sync_target_id, limit)
    }

    pub async fn sync_item(&self, sync_target_id: i32, item_id: &str) -> Result<Option<SyncItem>> {
        let db = self.inner.read().await;
        db.sync_item(sync_target_id, item_id)
    }

    pub async fn save_sync_time(
        &self,
        sync_target_id: i32,
        item_id: &str,
        sync_time: i64,
    ) -> Result<()> {
        let mut db = self.inner.write().await;
        db.save_sync_time(sync_target_id, item_id, sync_time)
    }

    pub async fn set_sync_disabled(
        &self,
        sync_target_id: i32,
        item_id: &str,
        reason: &str,
    ) -> Result<()> {
        let mut db = self.inner.write().await;
        db.set_sync_disabled(sync_target_id, item_id, reason)
    }

    pub async fn clear_sync_disabled(&self, sync_target_id: i32, item_id: &str) -> Result<()> {
        let mut db = self.inner.write().await;
        db.clear_sync_disabled(sync_target_id, item_id)
    }

    pub async fn disabled_sync_item_count(&self, sync_target_id: i32) -> Result<i64> {
        let db = self.inner.read().await;
        db.disabled_sync_item_count(sync_target_id)
    }

    pub async fn deleted_item_records(
        &self,
        sync_target_id: i32,
    ) -> Result<Vec<DeletedItemRecord>> {
        let db = self.inner.read().await;
        db.deleted_item_records(sync_target_id)
    }

    pub async fn remove_deleted_item_record(&self, record_id: i64) -> Result<()> {
        let mut db = self.inner.write().await;
        db.remove_deleted_item_record(record_id)
    }

    pub async fn resource_fetch_status(&self, resource_id: &str) -> Result<FetchStatus> {
        let db = self.inner.read().await;
        db.resource_fetch_status(resource_id)
    }

    pub async fn set_resource_fetch_status(
        &self,
        resource_id: &str,
        status: FetchStatus,
    ) -> Result<()> {
        let mut db = self.inner.write().await;
        db.set_resource_fetch_status(resource_id, status)
    }

    pub async fn folder_note_ids(&self, folder_id: &str) -> Result<Vec<String>> {
        let db = self.inner.read().await;
        db.folder_note_ids(folder_id)
    }

    pub async fn item_count(&self, item_type: ItemType) -> Result<i64> {
        let db = self.inner.read().await;
        db.item_count(item_type)
    }

    pub async fn synced_item_ids(&self, sync_target_id: i32) -> Result<Vec<String>> {
        let db = self.inner.read().await;
        db.synced_item_ids(sync_target_id)
    }

    pub async fn purge_orphaned_sync_items(&self) -> Result<usize> {
        let mut db = self.inner.write().await;
        db.purge_orphaned_sync_items()
    }

    pub async fn ensure_conflict_folder(&self) -> Result<()> {
        let mut db = self.inner.write().await;
        db.ensure_conflict_folder()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        let note = Item::new_note("hello", "world", "");
        let saved = store.save_item(&note, &SaveOptions::default()).await.unwrap();

        let loaded = store.load_item(&saved.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "hello");
        assert_eq!(loaded.body, "world");
        assert_eq!(loaded.updated_time, saved.updated_time);
    }

    #[tokio::test]
    async fn test_need_sync_excludes_synced_and_disabled() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        let a = store
            .save_item(&Item::new_note("a", "", ""), &SaveOptions::default())
            .await
            .unwrap();
        let b = store
            .save_item(&Item::new_note("b", "", ""), &SaveOptions::default())
            .await
            .unwrap();
        let c = store
            .save_item(&Item::new_note("c", "", ""), &SaveOptions::default())
            .await
            .unwrap();

        // a synced, b disabled, c untouched.
        store.save_sync_time(1, &a.id, a.updated_time).await.unwrap();
        store.set_sync_disabled(1, &b.id, "too large").await.unwrap();

        let batch = store.items_that_need_sync(1, 100).await.unwrap();
        let ids: Vec<_> = batch.items.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![c.id.clone()]);
        assert!(batch.never_synced_ids.contains(&c.id));
        assert!(!batch.has_more);

        // Other targets are unaffected by target 1 metadata.
        let other = store.items_that_need_sync(2, 100).await.unwrap();
        assert_eq!(other.items.len(), 3);
    }

    #[tokio::test]
    async fn test_need_sync_has_more_pagination() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .save_item(&Item::new_note(format!("n{}", i), "", ""), &SaveOptions::default())
                .await
                .unwrap();
        }
        let batch = store.items_that_need_sync(1, 3).await.unwrap();
        assert_eq!(batch.items.len(), 3);
        assert!(batch.has_more);
    }

    #[tokio::test]
    async fn test_delete_tracks_deletion() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        let note = store
            .save_item(&Item::new_note("n", "", ""), &SaveOptions::default())
            .await
            .unwrap();
        store.delete_item(&note.id, Some(1)).await.unwrap();

        assert!(store.load_item(&note.id).await.unwrap().is_none());
        let records = store.deleted_item_records(1).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_id, note.id);

        store.remove_deleted_item_record(records[0].id).await.unwrap();
        assert!(store.deleted_item_records(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_untracked_delete_leaves_no_record() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        let note = store
            .save_item(&Item::new_note("n", "", ""), &SaveOptions::default())
            .await
            .unwrap();
        store.delete_item(&note.id, None).await.unwrap();
        assert!(store.deleted_item_records(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_sourced_save_keeps_timestamps() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        let mut note = Item::new_note("remote", "", "");
        note.updated_time = 1111;
        note.created_time = 1000;

        let saved = store
            .save_item(&note, &SaveOptions::from_sync(1, 1111))
            .await
            .unwrap();
        assert_eq!(saved.updated_time, 1111);

        // Recorded sync time means the item does not need upload.
        let batch = store.items_that_need_sync(1, 100).await.unwrap();
        assert!(batch.items.is_empty());
    }

    #[tokio::test]
    async fn test_resource_fetch_status_defaults_idle() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        assert_eq!(
            store.resource_fetch_status("nope").await.unwrap(),
            FetchStatus::Idle
        );
        store
            .set_resource_fetch_status("r1", FetchStatus::Done)
            .await
            .unwrap();
        assert_eq!(
            store.resource_fetch_status("r1").await.unwrap(),
            FetchStatus::Done
        );
    }

    #[tokio::test]
    async fn test_synced_item_ids_excludes_never_synced() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        let a = store
            .save_item(&Item::new_note("a", "", ""), &SaveOptions::default())
            .await
            .unwrap();
        store
            .save_item(&Item::new_note("b", "", ""), &SaveOptions::default())
            .await
            .unwrap();
        store.save_sync_time(1, &a.id, a.updated_time).await.unwrap();

        assert_eq!(store.synced_item_ids(1).await.unwrap(), vec![a.id]);
    }

    #[tokio::test]
    async fn test_purge_orphaned_sync_items() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        store.save_sync_time(1, "ghost", 123).await.unwrap();
        let purged = store.purge_orphaned_sync_items().await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.sync_item(1, "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_folder_not_uploaded() {
        let store = AsyncItemStore::open_in_memory().await.unwrap();
        store.ensure_conflict_folder().await.unwrap();
        store.ensure_conflict_folder().await.unwrap();

        let batch = store.items_that_need_sync(1, 100).await.unwrap();
        assert!(batch.items.is_empty());
        assert!(store.load_item(CONFLICT_FOLDER_ID).await.unwrap().is_some());
    }
}
