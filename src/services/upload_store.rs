//! src/services/upload_store.rs
//!
//! UploadStore: durable metadata for the pipeline backed by SQLite. Every
//! transition that touches more than one row runs in a single transaction so
//! a crash never leaves a unit half-advanced.

use crate::models::{
    backup_folder::BackupFolder,
    bulk::{BulkItemRow, BulkRow, NewBulk, SourceDescriptor, UploadBulk},
    raw_block::{RawBlock, UploadedBlock},
    upload_unit::{BackupRecord, NewUploadUnit, UploadState, UploadUnit},
};
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, sqlx::Error>;

/// Schema applied by `--migrate` and by the tests.
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const UNIT_COLUMNS: &str = "id, user_id, volume_id, parent_id, source_uri, name, size_bytes, \
     mime_type, priority, network, state, failed_stage, link_id, revision_id, content_hash, \
     local_digest, block_size, block_count, delete_source, cache_policy, cancel_requested, last_error, bulk_id, \
     created_at, updated_at";

/// Run the embedded schema statement by statement.
pub async fn migrate(db: &SqlitePool) -> StoreResult<usize> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.lines().all(|l| l.trim_start().starts_with("--")))
        .collect::<Vec<_>>();

    for stmt in &statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(statements.len())
}

/// Result of adding a unit for a (user, parent, source) tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAdmission {
    Created(i64),
    /// An active unit already covers the same input; the request attached to it.
    Attached(i64),
}

impl UnitAdmission {
    pub fn unit_id(self) -> i64 {
        match self {
            Self::Created(id) | Self::Attached(id) => id,
        }
    }
}

#[derive(Clone)]
pub struct UploadStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
}

impl UploadStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    // ---- upload units ---------------------------------------------------

    pub async fn get_unit(&self, id: i64) -> StoreResult<Option<UploadUnit>> {
        sqlx::query_as::<_, UploadUnit>(&format!(
            "SELECT {UNIT_COLUMNS} FROM upload_units WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Units of a user in creation order.
    pub async fn list_units(&self, user_id: &str) -> StoreResult<Vec<UploadUnit>> {
        sqlx::query_as::<_, UploadUnit>(&format!(
            "SELECT {UNIT_COLUMNS} FROM upload_units WHERE user_id = ? ORDER BY id ASC"
        ))
        .bind(user_id)
        .fetch_all(&*self.db)
        .await
    }

    /// Ids of every unit that still has pipeline work to do.
    pub async fn active_unit_ids(&self) -> StoreResult<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM upload_units
             WHERE state NOT IN ('completed', 'failed', 'cancelled') ORDER BY id ASC",
        )
        .fetch_all(&*self.db)
        .await
    }

    async fn find_active_unit(
        tx: &mut Transaction<'_, Sqlite>,
        unit: &NewUploadUnit,
    ) -> StoreResult<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM upload_units
             WHERE user_id = ? AND parent_id = ? AND source_uri = ?
               AND state NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(&unit.user_id)
        .bind(&unit.parent_id)
        .bind(&unit.source_uri)
        .fetch_optional(&mut **tx)
        .await
    }

    async fn insert_unit_tx(
        tx: &mut Transaction<'_, Sqlite>,
        unit: &NewUploadUnit,
    ) -> StoreResult<UnitAdmission> {
        if let Some(existing) = Self::find_active_unit(tx, unit).await? {
            return Ok(UnitAdmission::Attached(existing));
        }
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO upload_units (
                user_id, volume_id, parent_id, source_uri, name, size_bytes, mime_type,
                priority, network, state, delete_source, cache_policy, cancel_requested,
                bulk_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            RETURNING id",
        )
        .bind(&unit.user_id)
        .bind(&unit.volume_id)
        .bind(&unit.parent_id)
        .bind(&unit.source_uri)
        .bind(&unit.name)
        .bind(unit.size_bytes)
        .bind(&unit.mime_type)
        .bind(unit.priority)
        .bind(unit.network)
        .bind(UploadState::Unprocessed)
        .bind(unit.delete_source)
        .bind(unit.cache_policy)
        .bind(unit.bulk_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;
        Ok(UnitAdmission::Created(id))
    }

    /// Add a unit unless an active one exists for the same input.
    pub async fn insert_unit(&self, unit: &NewUploadUnit) -> StoreResult<UnitAdmission> {
        let mut tx = self.db.begin().await?;
        let admission = Self::insert_unit_tx(&mut tx, unit).await?;
        tx.commit().await?;
        Ok(admission)
    }

    /// Compare-and-set the state. Refuses when the unit moved on or a
    /// cancellation was requested; the caller re-fetches on `false`. Moving
    /// into a committed state ignores the cancellation flag.
    pub async fn transition(&self, id: i64, from: UploadState, to: UploadState) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_units SET state = ?, updated_at = ?
             WHERE id = ? AND state = ? AND (cancel_requested = 0 OR ?)",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(id)
        .bind(from)
        .bind(to.is_committed())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Leave `Unprocessed` for `CreatingRemoteFile`, keeping the keyed
    /// keyed content hash and the local digest computed by the duplicate check.
    pub async fn begin_upload(
        &self,
        id: i64,
        content_hash: &str,
        local_digest: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_units SET content_hash = ?, local_digest = ?, state = ?, updated_at = ?
             WHERE id = ? AND state = ? AND cancel_requested = 0",
        )
        .bind(content_hash)
        .bind(local_digest)
        .bind(UploadState::CreatingRemoteFile)
        .bind(Utc::now())
        .bind(id)
        .bind(UploadState::Unprocessed)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the remote placeholder and advance to `EncryptingBlocks`.
    pub async fn set_remote_draft(
        &self,
        id: i64,
        link_id: &str,
        revision_id: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_units
             SET link_id = ?, revision_id = ?, state = ?, updated_at = ?
             WHERE id = ? AND state = ? AND cancel_requested = 0",
        )
        .bind(link_id)
        .bind(revision_id)
        .bind(UploadState::EncryptingBlocks)
        .bind(Utc::now())
        .bind(id)
        .bind(UploadState::CreatingRemoteFile)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist the block plan and every encrypted block, then advance to
    /// `RequestingTransferSlots`, all in one transaction.
    pub async fn plan_blocks(
        &self,
        id: i64,
        block_size: i64,
        blocks: &[RawBlock],
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            "UPDATE upload_units
             SET block_size = ?, block_count = ?, state = ?, updated_at = ?
             WHERE id = ? AND state = ? AND cancel_requested = 0",
        )
        .bind(block_size)
        .bind(blocks.len() as i64)
        .bind(UploadState::RequestingTransferSlots)
        .bind(Utc::now())
        .bind(id)
        .bind(UploadState::EncryptingBlocks)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM raw_blocks WHERE unit_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM uploaded_blocks WHERE unit_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for block in blocks {
            sqlx::query(
                "INSERT INTO raw_blocks (unit_id, idx, artifact, size_bytes, hash, signature)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(block.idx)
            .bind(&block.artifact)
            .bind(block.size_bytes)
            .bind(&block.hash)
            .bind(&block.signature)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Flag a unit for cancellation and return it as stored with the flag set.
    pub async fn request_cancel(&self, id: i64) -> StoreResult<Option<UploadUnit>> {
        sqlx::query_as::<_, UploadUnit>(&format!(
            "UPDATE upload_units SET cancel_requested = 1, updated_at = ?
             WHERE id = ?
             RETURNING {UNIT_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Remove a unit only while nothing was created remotely for it.
    /// Returns false when a draft got recorded first.
    pub async fn remove_unlinked_unit(&self, id: i64) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let removed = sqlx::query("DELETE FROM upload_units WHERE id = ? AND link_id IS NULL")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Ok(false);
        }
        Self::delete_unit_rows(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Move a unit to `Failed`, remembering the stage to resume from.
    pub async fn mark_failed(&self, id: i64, stage: UploadState, message: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_units
             SET state = ?, failed_stage = ?, last_error = ?, updated_at = ?
             WHERE id = ? AND state NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(UploadState::Failed)
        .bind(stage)
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Put a failed unit back at the stage it failed in.
    pub async fn reset_failed(&self, id: i64) -> StoreResult<Option<UploadState>> {
        let resume = sqlx::query_scalar::<_, Option<UploadState>>(
            "SELECT failed_stage FROM upload_units WHERE id = ? AND state = ?",
        )
        .bind(id)
        .bind(UploadState::Failed)
        .fetch_optional(&*self.db)
        .await?;
        let Some(resume) = resume else {
            return Ok(None);
        };
        let resume = resume.unwrap_or(UploadState::Unprocessed);
        sqlx::query(
            "UPDATE upload_units
             SET state = ?, failed_stage = NULL, last_error = NULL, updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(resume)
        .bind(Utc::now())
        .bind(id)
        .bind(UploadState::Failed)
        .execute(&*self.db)
        .await?;
        Ok(Some(resume))
    }

    /// Remove a unit and all of its block rows.
    pub async fn remove_unit(&self, id: i64) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        Self::delete_unit_rows(&mut tx, id).await?;
        tx.commit().await
    }

    async fn delete_unit_rows(tx: &mut Transaction<'_, Sqlite>, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM raw_blocks WHERE unit_id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM uploaded_blocks WHERE unit_id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM upload_units WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Record the finished upload and remove the unit with its residual rows.
    /// Nothing is written when the unit is gone or was cancelled before its
    /// revision was committed; the caller then re-reads the unit.
    pub async fn complete_unit(&self, id: i64, record: &BackupRecord) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let current = sqlx::query_as::<_, (UploadState, bool)>(
            "SELECT state, cancel_requested FROM upload_units WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        match current {
            Some((state, cancelled)) if !cancelled || state.is_committed() => {}
            _ => return Ok(false),
        }

        sqlx::query(
            "INSERT INTO backup_history (
                user_id, volume_id, parent_id, source_uri, size_bytes, link_id,
                revision_id, attached, bytes_sent, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, parent_id, source_uri) DO UPDATE SET
                volume_id = excluded.volume_id,
                size_bytes = excluded.size_bytes,
                link_id = excluded.link_id,
                revision_id = excluded.revision_id,
                attached = excluded.attached,
                bytes_sent = excluded.bytes_sent,
                completed_at = excluded.completed_at",
        )
        .bind(&record.user_id)
        .bind(&record.volume_id)
        .bind(&record.parent_id)
        .bind(&record.source_uri)
        .bind(record.size_bytes)
        .bind(&record.link_id)
        .bind(&record.revision_id)
        .bind(record.attached)
        .bind(record.bytes_sent)
        .bind(record.completed_at)
        .execute(&mut *tx)
        .await?;
        Self::delete_unit_rows(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn backup_record(
        &self,
        user_id: &str,
        parent_id: &str,
        source_uri: &str,
    ) -> StoreResult<Option<BackupRecord>> {
        sqlx::query_as::<_, BackupRecord>(
            "SELECT user_id, volume_id, parent_id, source_uri, size_bytes, link_id, revision_id,
                    attached, bytes_sent, completed_at
             FROM backup_history WHERE user_id = ? AND parent_id = ? AND source_uri = ?",
        )
        .bind(user_id)
        .bind(parent_id)
        .bind(source_uri)
        .fetch_optional(&*self.db)
        .await
    }

    // ---- blocks ---------------------------------------------------------

    /// Next page of unconfirmed blocks in index order.
    pub async fn pending_blocks(&self, unit_id: i64, limit: i64) -> StoreResult<Vec<RawBlock>> {
        sqlx::query_as::<_, RawBlock>(
            "SELECT unit_id, idx, artifact, size_bytes, hash, signature
             FROM raw_blocks WHERE unit_id = ? ORDER BY idx ASC LIMIT ?",
        )
        .bind(unit_id)
        .bind(limit)
        .fetch_all(&*self.db)
        .await
    }

    pub async fn count_pending_blocks(&self, unit_id: i64) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM raw_blocks WHERE unit_id = ?")
            .bind(unit_id)
            .fetch_one(&*self.db)
            .await
    }

    /// Replace a block's artifact after it had to be re-encrypted.
    pub async fn replace_block(&self, block: &RawBlock) -> StoreResult<()> {
        sqlx::query(
            "UPDATE raw_blocks SET artifact = ?, size_bytes = ?, hash = ?, signature = ?
             WHERE unit_id = ? AND idx = ?",
        )
        .bind(&block.artifact)
        .bind(block.size_bytes)
        .bind(&block.hash)
        .bind(&block.signature)
        .bind(block.unit_id)
        .bind(block.idx)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Mark a block confirmed: drop its RawBlock row and keep its hash for
    /// the manifest, atomically.
    pub async fn confirm_block(&self, block: &RawBlock) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM raw_blocks WHERE unit_id = ? AND idx = ?")
            .bind(block.unit_id)
            .bind(block.idx)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO uploaded_blocks (unit_id, idx, size_bytes, hash)
             VALUES (?, ?, ?, ?)",
        )
        .bind(block.unit_id)
        .bind(block.idx)
        .bind(block.size_bytes)
        .bind(&block.hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    pub async fn uploaded_blocks(&self, unit_id: i64) -> StoreResult<Vec<UploadedBlock>> {
        sqlx::query_as::<_, UploadedBlock>(
            "SELECT unit_id, idx, size_bytes, hash FROM uploaded_blocks
             WHERE unit_id = ? ORDER BY idx ASC",
        )
        .bind(unit_id)
        .fetch_all(&*self.db)
        .await
    }

    /// Bytes confirmed by the remote so far.
    pub async fn confirmed_bytes(&self, unit_id: i64) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM uploaded_blocks WHERE unit_id = ?",
        )
        .bind(unit_id)
        .fetch_one(&*self.db)
        .await
    }

    // ---- bulks ----------------------------------------------------------

    /// Persist a bulk header and its items with their submission positions.
    pub async fn insert_bulk(&self, bulk: &NewBulk) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO upload_bulks (
                id, user_id, volume_id, parent_id, priority, network, delete_source,
                cache_policy, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&bulk.user_id)
        .bind(&bulk.volume_id)
        .bind(&bulk.parent_id)
        .bind(bulk.priority)
        .bind(bulk.network)
        .bind(bulk.delete_source)
        .bind(bulk.cache_policy)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        for (position, item) in bulk.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO upload_bulk_items
                    (bulk_id, position, source_uri, name, size_bytes, mime_type)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(position as i64)
            .bind(&item.source_uri)
            .bind(&item.name)
            .bind(item.size_bytes)
            .bind(&item.mime_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    /// Read a bulk back with its remaining items in submission order.
    pub async fn load_bulk(&self, id: Uuid) -> StoreResult<Option<UploadBulk>> {
        let header = sqlx::query_as::<_, BulkRow>(
            "SELECT id, user_id, volume_id, parent_id, priority, network, delete_source,
                    cache_policy, created_at
             FROM upload_bulks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        let Some(header) = header else {
            return Ok(None);
        };

        let items = sqlx::query_as::<_, BulkItemRow>(
            "SELECT bulk_id, position, source_uri, name, size_bytes, mime_type
             FROM upload_bulk_items WHERE bulk_id = ? ORDER BY position ASC",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(SourceDescriptor::from)
        .collect();

        Ok(Some(UploadBulk { header, items }))
    }

    /// Next item of a bulk still waiting to become a unit.
    pub async fn next_bulk_item(&self, bulk_id: Uuid) -> StoreResult<Option<BulkItemRow>> {
        sqlx::query_as::<_, BulkItemRow>(
            "SELECT bulk_id, position, source_uri, name, size_bytes, mime_type
             FROM upload_bulk_items WHERE bulk_id = ? ORDER BY position ASC LIMIT 1",
        )
        .bind(bulk_id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Turn one bulk item into a unit and drop the item, atomically.
    pub async fn materialize_item(
        &self,
        item: &BulkItemRow,
        unit: &NewUploadUnit,
    ) -> StoreResult<UnitAdmission> {
        let mut tx = self.db.begin().await?;
        let admission = Self::insert_unit_tx(&mut tx, unit).await?;
        sqlx::query("DELETE FROM upload_bulk_items WHERE bulk_id = ? AND position = ?")
            .bind(item.bulk_id)
            .bind(item.position)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(admission)
    }

    /// Bulks that still have items to materialize, oldest first.
    pub async fn pending_bulks(&self) -> StoreResult<Vec<BulkRow>> {
        sqlx::query_as::<_, BulkRow>(
            "SELECT id, user_id, volume_id, parent_id, priority, network, delete_source,
                    cache_policy, created_at
             FROM upload_bulks ORDER BY created_at ASC",
        )
        .fetch_all(&*self.db)
        .await
    }

    pub async fn delete_bulk(&self, id: Uuid) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM upload_bulk_items WHERE bulk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upload_bulks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    // ---- backup folders -------------------------------------------------

    pub async fn get_backup_folder(&self, id: &str) -> StoreResult<Option<BackupFolder>> {
        sqlx::query_as::<_, BackupFolder>(
            "SELECT id, user_id, volume_id, bucket_id, local_path, remote_folder_id, network, enabled
             FROM backup_folders WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Used by the setup flow to register or update a folder.
    pub async fn upsert_backup_folder(&self, folder: &BackupFolder) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO backup_folders
                (id, user_id, volume_id, bucket_id, local_path, remote_folder_id, network, enabled)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                volume_id = excluded.volume_id,
                bucket_id = excluded.bucket_id,
                local_path = excluded.local_path,
                remote_folder_id = excluded.remote_folder_id,
                network = excluded.network,
                enabled = excluded.enabled",
        )
        .bind(&folder.id)
        .bind(&folder.user_id)
        .bind(&folder.volume_id)
        .bind(folder.bucket_id)
        .bind(&folder.local_path)
        .bind(&folder.remote_folder_id)
        .bind(folder.network)
        .bind(folder.enabled)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upload_unit::{CachePolicy, NetworkPolicy, Priority};
    use crate::testutil::test_pool;

    fn new_unit(uri: &str) -> NewUploadUnit {
        NewUploadUnit {
            user_id: "alice".into(),
            volume_id: "vol".into(),
            parent_id: "photos".into(),
            source_uri: uri.into(),
            name: "img.jpg".into(),
            size_bytes: 10,
            mime_type: "image/jpeg".into(),
            priority: Priority::User,
            network: NetworkPolicy::Any,
            delete_source: false,
            cache_policy: CachePolicy::Discard,
            bulk_id: None,
        }
    }

    fn raw(unit_id: i64, idx: i64) -> RawBlock {
        RawBlock {
            unit_id,
            idx,
            artifact: format!("/tmp/block-{idx}"),
            size_bytes: 4,
            hash: format!("h{idx}"),
            signature: "s".into(),
        }
    }

    #[tokio::test]
    async fn identical_input_attaches_to_active_unit() {
        let store = UploadStore::new(test_pool().await);
        let first = store.insert_unit(&new_unit("file:///a.jpg")).await.unwrap();
        let second = store.insert_unit(&new_unit("file:///a.jpg")).await.unwrap();
        assert!(matches!(first, UnitAdmission::Created(_)));
        assert_eq!(second, UnitAdmission::Attached(first.unit_id()));

        store
            .mark_failed(first.unit_id(), UploadState::Unprocessed, "boom")
            .await
            .unwrap();
        let third = store.insert_unit(&new_unit("file:///a.jpg")).await.unwrap();
        assert!(matches!(third, UnitAdmission::Created(id) if id != first.unit_id()));
    }

    #[tokio::test]
    async fn transition_is_compare_and_set_and_honours_cancel() {
        let store = UploadStore::new(test_pool().await);
        let id = store.insert_unit(&new_unit("a")).await.unwrap().unit_id();

        assert!(!store
            .transition(id, UploadState::EncryptingBlocks, UploadState::RequestingTransferSlots)
            .await
            .unwrap());
        assert!(store
            .transition(id, UploadState::Unprocessed, UploadState::CreatingRemoteFile)
            .await
            .unwrap());

        let flagged = store.request_cancel(id).await.unwrap().unwrap();
        assert!(flagged.cancel_requested);
        assert!(!store
            .set_remote_draft(id, "link", "rev")
            .await
            .unwrap());
        assert!(store.get_unit(id).await.unwrap().unwrap().cancel_requested);
        assert!(store.request_cancel(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_keeps_a_unit_whose_draft_was_recorded() {
        let store = UploadStore::new(test_pool().await);
        let id = store.insert_unit(&new_unit("a")).await.unwrap().unit_id();
        store
            .transition(id, UploadState::Unprocessed, UploadState::CreatingRemoteFile)
            .await
            .unwrap();
        assert!(store.set_remote_draft(id, "link", "rev").await.unwrap());

        let flagged = store.request_cancel(id).await.unwrap().unwrap();
        assert_eq!(flagged.link_id.as_deref(), Some("link"));
        assert!(!store.remove_unlinked_unit(id).await.unwrap());
        assert!(store.get_unit(id).await.unwrap().is_some());

        let other = store.insert_unit(&new_unit("b")).await.unwrap().unit_id();
        store.request_cancel(other).await.unwrap();
        assert!(store.remove_unlinked_unit(other).await.unwrap());
        assert!(store.get_unit(other).await.unwrap().is_none());
    }

    fn record(uri: &str) -> BackupRecord {
        BackupRecord {
            user_id: "alice".into(),
            volume_id: "vol".into(),
            parent_id: "photos".into(),
            source_uri: uri.into(),
            size_bytes: 10,
            link_id: "link".into(),
            revision_id: None,
            attached: true,
            bytes_sent: 0,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn completion_requires_a_live_uncancelled_unit() {
        let store = UploadStore::new(test_pool().await);
        assert!(!store.complete_unit(42, &record("gone")).await.unwrap());
        assert!(store.backup_record("alice", "photos", "gone").await.unwrap().is_none());

        let id = store.insert_unit(&new_unit("a")).await.unwrap().unit_id();
        store.request_cancel(id).await.unwrap();
        assert!(!store.complete_unit(id, &record("a")).await.unwrap());
        assert!(store.backup_record("alice", "photos", "a").await.unwrap().is_none());
        assert!(store.get_unit(id).await.unwrap().is_some());

        let done = store.insert_unit(&new_unit("b")).await.unwrap().unit_id();
        assert!(store.complete_unit(done, &record("b")).await.unwrap());
        assert!(store.backup_record("alice", "photos", "b").await.unwrap().is_some());
        assert!(store.get_unit(done).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_unit_completes_despite_late_cancel() {
        let store = UploadStore::new(test_pool().await);
        let id = store.insert_unit(&new_unit("a")).await.unwrap().unit_id();
        sqlx::query("UPDATE upload_units SET state = ? WHERE id = ?")
            .bind(UploadState::CleaningUp)
            .bind(id)
            .execute(&*store.db)
            .await
            .unwrap();
        store.request_cancel(id).await.unwrap();
        assert!(store.complete_unit(id, &record("a")).await.unwrap());
    }

    #[tokio::test]
    async fn confirming_blocks_moves_rows_atomically() {
        let store = UploadStore::new(test_pool().await);
        let id = store.insert_unit(&new_unit("a")).await.unwrap().unit_id();
        store
            .transition(id, UploadState::Unprocessed, UploadState::CreatingRemoteFile)
            .await
            .unwrap();
        store.set_remote_draft(id, "link", "rev").await.unwrap();
        let blocks = vec![raw(id, 1), raw(id, 2), raw(id, 3)];
        assert!(store.plan_blocks(id, 4, &blocks).await.unwrap());

        store.confirm_block(&blocks[1]).await.unwrap();
        let pending: Vec<i64> = store
            .pending_blocks(id, 10)
            .await
            .unwrap()
            .iter()
            .map(|b| b.idx)
            .collect();
        assert_eq!(pending, vec![1, 3]);
        assert_eq!(store.confirmed_bytes(id).await.unwrap(), 4);

        let unit = store.get_unit(id).await.unwrap().unwrap();
        assert_eq!(unit.block_count, Some(3));
        assert_eq!(unit.state, UploadState::RequestingTransferSlots);
    }

    #[tokio::test]
    async fn failed_unit_resumes_at_failed_stage() {
        let store = UploadStore::new(test_pool().await);
        let id = store.insert_unit(&new_unit("a")).await.unwrap().unit_id();
        store
            .mark_failed(id, UploadState::TransferringBlocks, "timeout")
            .await
            .unwrap();
        assert_eq!(
            store.reset_failed(id).await.unwrap(),
            Some(UploadState::TransferringBlocks)
        );
        let unit = store.get_unit(id).await.unwrap().unwrap();
        assert_eq!(unit.state, UploadState::TransferringBlocks);
        assert_eq!(unit.last_error, None);
        assert_eq!(store.reset_failed(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bulk_round_trip_preserves_order() {
        let store = UploadStore::new(test_pool().await);
        let items: Vec<SourceDescriptor> = ["z.jpg", "a.jpg", "m.jpg", "b.jpg"]
            .iter()
            .map(|name| SourceDescriptor {
                source_uri: format!("file:///dcim/{name}"),
                name: name.to_string(),
                size_bytes: 1,
                mime_type: "image/jpeg".into(),
            })
            .collect();
        let bulk = NewBulk {
            user_id: "alice".into(),
            volume_id: "vol".into(),
            parent_id: "photos".into(),
            priority: Priority::Backup,
            network: NetworkPolicy::UnmeteredOnly,
            delete_source: false,
            cache_policy: CachePolicy::Discard,
            items: items.clone(),
        };

        let id = store.insert_bulk(&bulk).await.unwrap();
        let loaded = store.load_bulk(id).await.unwrap().unwrap();
        assert_eq!(loaded.items, items);
        assert_eq!(loaded.header.network, NetworkPolicy::UnmeteredOnly);

        store.delete_bulk(id).await.unwrap();
        assert!(store.load_bulk(id).await.unwrap().is_none());
    }
}
