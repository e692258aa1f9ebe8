//! src/services/fs_drive.rs
//!
//! FsDrive: a `RemoteDrive` backed by a local directory for block payloads
//! and `remote_*` SQLite tables for links, revisions and block lists. The
//! daemon uses it as a loopback remote (e.g. a mounted NAS share); block
//! payloads are sharded beneath `base_path/{shard}/{shard}/{revision}-{index}`.

use crate::models::revision::{Draft, RemoteFileRef, Revision, RevisionBlock, RevisionState};
use crate::services::{
    digest_service,
    remote::{
        BlockSlot, BlockSlotRequest, DraftRequest, RemoteDrive, RemoteError, RemoteResult,
        RevisionCommit,
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct FsDrive {
    /// Shared SQLite pool holding the remote tables.
    pub db: Arc<SqlitePool>,

    /// Base directory where block payloads are stored.
    pub base_path: PathBuf,

    /// Largest block the drive accepts, in bytes.
    pub max_block_size: u64,
}

fn backend(err: sqlx::Error) -> RemoteError {
    RemoteError::Unavailable(format!("metadata: {err}"))
}

fn io_failure(err: io::Error) -> RemoteError {
    RemoteError::Unavailable(format!("disk: {err}"))
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

impl FsDrive {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, max_block_size: u64) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            max_block_size,
        }
    }

    /// Two-level shard identifiers for a block, from MD5(revision/index).
    fn block_shards(revision_id: &str, index: u32) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", revision_id, index));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn block_path(&self, revision_id: &str, index: u32) -> PathBuf {
        let (shard_a, shard_b) = Self::block_shards(revision_id, index);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("{}-{}", revision_id, index));
        path
    }

    fn slot_url(revision_id: &str, index: u32) -> String {
        format!("{}/{}", revision_id, index)
    }

    fn parse_slot_url(url: &str) -> RemoteResult<(&str, u32)> {
        let (revision_id, index) = url
            .split_once('/')
            .ok_or_else(|| RemoteError::Validation(format!("malformed slot url `{url}`")))?;
        let index = index
            .parse::<u32>()
            .map_err(|_| RemoteError::Validation(format!("malformed slot url `{url}`")))?;
        Ok((revision_id, index))
    }

    async fn revision_state(&self, revision_id: &str) -> RemoteResult<Option<(String, String)>> {
        sqlx::query_as::<_, (String, String)>(
            "SELECT link_id, state FROM remote_revisions WHERE revision_id = ?",
        )
        .bind(revision_id)
        .fetch_optional(&*self.db)
        .await
        .map_err(backend)
    }

    async fn insert_draft_revision(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        draft: &Draft,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO remote_revisions
                (revision_id, link_id, client_uid, state, manifest_signature, block_count, created_at)
             VALUES (?, ?, ?, 'draft', NULL, NULL, ?)",
        )
        .bind(&draft.revision_id)
        .bind(&draft.link_id)
        .bind(&draft.client_uid)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Write bytes to `path` through a temp file, fsync, then rename.
    async fn write_atomically(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "block path missing parent"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let written = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(path).await?;
                fs::rename(&tmp_path, path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Number of revisions ever created for a link.
    #[cfg(test)]
    pub async fn revision_count(&self, link_id: &str) -> RemoteResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM remote_revisions WHERE link_id = ?")
            .bind(link_id)
            .fetch_one(&*self.db)
            .await
            .map_err(backend)
    }

    /// Number of links (drafts and active files).
    #[cfg(test)]
    pub async fn link_count(&self) -> RemoteResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM remote_links")
            .fetch_one(&*self.db)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl RemoteDrive for FsDrive {
    async fn find_by_hash(
        &self,
        volume_id: &str,
        parent_id: &str,
        content_hash: &str,
    ) -> RemoteResult<Option<RemoteFileRef>> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT link_id, name FROM remote_links
             WHERE volume_id = ? AND parent_id = ? AND content_hash = ? AND state = 'active'
             LIMIT 1",
        )
        .bind(volume_id)
        .bind(parent_id)
        .bind(content_hash)
        .fetch_optional(&*self.db)
        .await
        .map_err(backend)?;

        Ok(row.map(|(link_id, name)| RemoteFileRef {
            volume_id: volume_id.to_string(),
            parent_id: parent_id.to_string(),
            link_id,
            name,
        }))
    }

    async fn create_draft(&self, request: &DraftRequest) -> RemoteResult<Draft> {
        let draft = Draft {
            link_id: Uuid::new_v4().to_string(),
            revision_id: Uuid::new_v4().to_string(),
            client_uid: request.client_uid.clone(),
        };
        let now = Utc::now();

        let mut tx = self.db.begin().await.map_err(backend)?;
        let inserted = sqlx::query(
            "INSERT INTO remote_links
                (link_id, volume_id, parent_id, name, client_uid, content_hash, state,
                 active_revision, created_at)
             VALUES (?, ?, ?, ?, ?, NULL, 'draft', NULL, ?)",
        )
        .bind(&draft.link_id)
        .bind(&request.volume_id)
        .bind(&request.parent_id)
        .bind(&request.name)
        .bind(&request.client_uid)
        .bind(now)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(RemoteError::Conflict(format!(
                    "name `{}` already exists in folder",
                    request.name
                )));
            }
            Err(err) => return Err(backend(err)),
        }

        Self::insert_draft_revision(&mut tx, &draft)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        debug!("created draft link {} revision {}", draft.link_id, draft.revision_id);
        Ok(draft)
    }

    async fn create_revision(&self, link_id: &str, client_uid: &str) -> RemoteResult<Draft> {
        let draft = Draft {
            link_id: link_id.to_string(),
            revision_id: Uuid::new_v4().to_string(),
            client_uid: client_uid.to_string(),
        };

        let mut tx = self.db.begin().await.map_err(backend)?;
        let state = sqlx::query_scalar::<_, String>("SELECT state FROM remote_links WHERE link_id = ?")
            .bind(link_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        match state.as_deref() {
            None => return Err(RemoteError::NotFound(format!("link {link_id}"))),
            Some("active") => {}
            Some(_) => {
                return Err(RemoteError::Conflict(format!(
                    "link {link_id} has no committed revision yet"
                )));
            }
        }

        match Self::insert_draft_revision(&mut tx, &draft).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(RemoteError::Conflict(format!(
                    "link {link_id} already has a draft revision"
                )));
            }
            Err(err) => return Err(backend(err)),
        }
        tx.commit().await.map_err(backend)?;

        debug!("created revision {} on link {}", draft.revision_id, link_id);
        Ok(draft)
    }

    async fn find_draft(
        &self,
        volume_id: &str,
        parent_id: &str,
        client_uid: &str,
    ) -> RemoteResult<Option<Draft>> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT l.link_id, r.revision_id
             FROM remote_links l
             JOIN remote_revisions r ON r.link_id = l.link_id AND r.state = 'draft'
             WHERE l.volume_id = ? AND l.parent_id = ? AND r.client_uid = ?",
        )
        .bind(volume_id)
        .bind(parent_id)
        .bind(client_uid)
        .fetch_optional(&*self.db)
        .await
        .map_err(backend)?;

        Ok(row.map(|(link_id, revision_id)| Draft {
            link_id,
            revision_id,
            client_uid: client_uid.to_string(),
        }))
    }

    async fn request_block_slots(
        &self,
        link_id: &str,
        revision_id: &str,
        blocks: &[BlockSlotRequest],
    ) -> RemoteResult<Vec<BlockSlot>> {
        match self.revision_state(revision_id).await? {
            Some((owner, state)) if owner == link_id && state == "draft" => {}
            Some((owner, _)) if owner == link_id => {
                return Err(RemoteError::Conflict(format!(
                    "revision {revision_id} is already committed"
                )));
            }
            _ => return Err(RemoteError::NotFound(format!("revision {revision_id}"))),
        }

        let mut slots = Vec::with_capacity(blocks.len());
        let mut tx = self.db.begin().await.map_err(backend)?;
        for block in blocks {
            if block.index == 0 {
                return Err(RemoteError::Validation("block indices start at 1".into()));
            }
            if block.size_bytes > self.max_block_size {
                return Err(RemoteError::Validation(format!(
                    "block {} is {} bytes, limit is {}",
                    block.index, block.size_bytes, self.max_block_size
                )));
            }
            sqlx::query(
                "INSERT INTO remote_blocks (revision_id, idx, hash, signature, size_bytes, confirmed)
                 VALUES (?, ?, ?, ?, ?, 0)
                 ON CONFLICT(revision_id, idx) DO UPDATE SET
                    hash = excluded.hash,
                    signature = excluded.signature,
                    size_bytes = excluded.size_bytes,
                    confirmed = 0",
            )
            .bind(revision_id)
            .bind(block.index as i64)
            .bind(&block.hash)
            .bind(&block.signature)
            .bind(block.size_bytes as i64)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            slots.push(BlockSlot {
                index: block.index,
                url: Self::slot_url(revision_id, block.index),
                hash: block.hash.clone(),
            });
        }
        tx.commit().await.map_err(backend)?;
        Ok(slots)
    }

    async fn transfer_block(&self, slot: &BlockSlot, data: Bytes) -> RemoteResult<()> {
        let (revision_id, index) = Self::parse_slot_url(&slot.url)?;
        let expected = sqlx::query_scalar::<_, String>(
            "SELECT hash FROM remote_blocks WHERE revision_id = ? AND idx = ?",
        )
        .bind(revision_id)
        .bind(index as i64)
        .fetch_optional(&*self.db)
        .await
        .map_err(backend)?
        .ok_or_else(|| RemoteError::NotFound(format!("slot {}", slot.url)))?;

        let actual = general_purpose::STANDARD.encode(digest_service::block_digest(&data));
        if actual != expected {
            return Err(RemoteError::Validation(format!(
                "block {index} hash mismatch: expected {expected}, got {actual}"
            )));
        }

        let path = self.block_path(revision_id, index);
        self.write_atomically(&path, &data).await.map_err(io_failure)?;

        sqlx::query("UPDATE remote_blocks SET confirmed = 1 WHERE revision_id = ? AND idx = ?")
            .bind(revision_id)
            .bind(index as i64)
            .execute(&*self.db)
            .await
            .map_err(backend)?;
        debug!("stored block {} of revision {}", index, revision_id);
        Ok(())
    }

    async fn commit_revision(&self, commit: &RevisionCommit) -> RemoteResult<()> {
        let mut tx = self.db.begin().await.map_err(backend)?;
        let current = sqlx::query_as::<_, (String, String, Option<String>)>(
            "SELECT link_id, state, manifest_signature FROM remote_revisions WHERE revision_id = ?",
        )
        .bind(&commit.revision_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        match current {
            None => return Err(RemoteError::NotFound(format!("revision {}", commit.revision_id))),
            Some((link_id, _, _)) if link_id != commit.link_id => {
                return Err(RemoteError::Validation(format!(
                    "revision {} does not belong to link {}",
                    commit.revision_id, commit.link_id
                )));
            }
            Some((_, state, signature)) if state == "active" => {
                return if signature.as_deref() == Some(commit.manifest_signature.as_str()) {
                    Ok(())
                } else {
                    Err(RemoteError::Conflict(format!(
                        "revision {} already committed with another manifest",
                        commit.revision_id
                    )))
                };
            }
            Some((_, state, _)) if state == "obsolete" => {
                return Err(RemoteError::Conflict(format!(
                    "revision {} was superseded",
                    commit.revision_id
                )));
            }
            Some(_) => {}
        }

        let confirmed = sqlx::query_as::<_, (i64, String)>(
            "SELECT idx, hash FROM remote_blocks
             WHERE revision_id = ? AND confirmed = 1 ORDER BY idx ASC",
        )
        .bind(&commit.revision_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        let matches = confirmed.len() == commit.block_hashes.len()
            && confirmed
                .iter()
                .zip(&commit.block_hashes)
                .enumerate()
                .all(|(pos, ((idx, hash), expected))| *idx == pos as i64 + 1 && hash == expected);
        if !matches {
            return Err(RemoteError::Validation(format!(
                "revision {} block list does not match the manifest",
                commit.revision_id
            )));
        }

        sqlx::query(
            "UPDATE remote_revisions SET state = 'obsolete'
             WHERE link_id = ? AND state = 'active'",
        )
        .bind(&commit.link_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query(
            "UPDATE remote_revisions SET state = 'active', manifest_signature = ?, block_count = ?
             WHERE revision_id = ?",
        )
        .bind(&commit.manifest_signature)
        .bind(commit.block_hashes.len() as i64)
        .bind(&commit.revision_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query(
            "UPDATE remote_links SET state = 'active', content_hash = ?, active_revision = ?
             WHERE link_id = ?",
        )
        .bind(&commit.content_hash)
        .bind(&commit.revision_id)
        .bind(&commit.link_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn get_revision(
        &self,
        link_id: &str,
        revision_id: &str,
    ) -> RemoteResult<Option<Revision>> {
        let Some((owner, state)) = self.revision_state(revision_id).await? else {
            return Ok(None);
        };
        if owner != link_id {
            return Ok(None);
        }
        let manifest_signature = sqlx::query_scalar::<_, Option<String>>(
            "SELECT manifest_signature FROM remote_revisions WHERE revision_id = ?",
        )
        .bind(revision_id)
        .fetch_one(&*self.db)
        .await
        .map_err(backend)?;

        let blocks = sqlx::query_as::<_, (i64, String, String)>(
            "SELECT idx, hash, signature FROM remote_blocks
             WHERE revision_id = ? AND confirmed = 1 ORDER BY idx ASC",
        )
        .bind(revision_id)
        .fetch_all(&*self.db)
        .await
        .map_err(backend)?
        .into_iter()
        .map(|(idx, hash, signature)| RevisionBlock {
            index: idx as u32,
            url: Self::slot_url(revision_id, idx as u32),
            hash,
            signature,
        })
        .collect();

        Ok(Some(Revision {
            revision_id: revision_id.to_string(),
            link_id: owner,
            state: match state.as_str() {
                "active" => RevisionState::Active,
                "obsolete" => RevisionState::Obsolete,
                _ => RevisionState::Draft,
            },
            blocks,
            manifest_signature,
        }))
    }

    async fn delete_draft(&self, link_id: &str, revision_id: &str) -> RemoteResult<()> {
        let mut tx = self.db.begin().await.map_err(backend)?;
        let blocks = sqlx::query_scalar::<_, i64>(
            "SELECT idx FROM remote_blocks WHERE revision_id = ?",
        )
        .bind(revision_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        let removed = sqlx::query(
            "DELETE FROM remote_revisions WHERE revision_id = ? AND link_id = ? AND state = 'draft'",
        )
        .bind(revision_id)
        .bind(link_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?
        .rows_affected();
        if removed == 0 {
            drop(tx);
            return match self.revision_state(revision_id).await? {
                Some((owner, _)) if owner == link_id => Err(RemoteError::Conflict(format!(
                    "revision {revision_id} is committed"
                ))),
                _ => Ok(()),
            };
        }

        sqlx::query("DELETE FROM remote_blocks WHERE revision_id = ?")
            .bind(revision_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query(
            "DELETE FROM remote_links
             WHERE link_id = ? AND active_revision IS NULL
               AND NOT EXISTS (SELECT 1 FROM remote_revisions WHERE link_id = ?)",
        )
        .bind(link_id)
        .bind(link_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        for idx in blocks {
            let path = self.block_path(revision_id, idx as u32);
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed block {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => debug!("failed to remove block {}: {}", path.display(), err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_pool;

    async fn drive() -> (FsDrive, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let drive = FsDrive::new(test_pool().await, dir.path(), 1024);
        (drive, dir)
    }

    fn request(name: &str) -> DraftRequest {
        DraftRequest {
            volume_id: "vol".into(),
            parent_id: "photos".into(),
            name: name.into(),
            mime_type: "image/jpeg".into(),
            client_uid: format!("client-{name}"),
        }
    }

    fn slot_request(index: u32, data: &[u8]) -> BlockSlotRequest {
        BlockSlotRequest {
            index,
            size_bytes: data.len() as u64,
            hash: general_purpose::STANDARD.encode(digest_service::block_digest(data)),
            signature: "sig".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict_and_draft_is_findable() {
        let (drive, _dir) = drive().await;
        let draft = drive.create_draft(&request("a.jpg")).await.unwrap();
        let err = drive.create_draft(&request("a.jpg")).await.unwrap_err();
        assert!(matches!(err, RemoteError::Conflict(_)));

        let found = drive
            .find_draft("vol", "photos", "client-a.jpg")
            .await
            .unwrap();
        assert_eq!(found, Some(draft));
        let foreign = drive
            .find_draft("vol", "photos", "someone-else")
            .await
            .unwrap();
        assert_eq!(foreign, None);
    }

    #[tokio::test]
    async fn transfer_rejects_corrupted_block() {
        let (drive, _dir) = drive().await;
        let draft = drive.create_draft(&request("b.jpg")).await.unwrap();
        let slots = drive
            .request_block_slots(&draft.link_id, &draft.revision_id, &[slot_request(1, b"good")])
            .await
            .unwrap();
        let err = drive
            .transfer_block(&slots[0], Bytes::from_static(b"evil"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
    }

    #[tokio::test]
    async fn oversized_block_is_rejected() {
        let (drive, _dir) = drive().await;
        let draft = drive.create_draft(&request("c.jpg")).await.unwrap();
        let big = vec![0u8; 2048];
        let err = drive
            .request_block_slots(&draft.link_id, &draft.revision_id, &[slot_request(1, &big)])
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
    }

    #[tokio::test]
    async fn commit_is_idempotent_and_makes_file_findable() {
        let (drive, _dir) = drive().await;
        let draft = drive.create_draft(&request("d.jpg")).await.unwrap();
        let req = slot_request(1, b"block one");
        let slots = drive
            .request_block_slots(&draft.link_id, &draft.revision_id, &[req.clone()])
            .await
            .unwrap();
        drive
            .transfer_block(&slots[0], Bytes::from_static(b"block one"))
            .await
            .unwrap();

        let commit = RevisionCommit {
            link_id: draft.link_id.clone(),
            revision_id: draft.revision_id.clone(),
            block_hashes: vec![req.hash.clone()],
            manifest_signature: "manifest".into(),
            content_hash: "keyed".into(),
            size_bytes: 9,
        };
        drive.commit_revision(&commit).await.unwrap();
        drive.commit_revision(&commit).await.unwrap();

        assert_eq!(drive.revision_count(&draft.link_id).await.unwrap(), 1);
        let revision = drive
            .get_revision(&draft.link_id, &draft.revision_id)
            .await
            .unwrap()
            .unwrap();
        assert!(revision.is_complete(1));
        let found = drive.find_by_hash("vol", "photos", "keyed").await.unwrap();
        assert_eq!(found.map(|f| f.link_id), Some(draft.link_id.clone()));
        assert!(matches!(
            drive.delete_draft(&draft.link_id, &draft.revision_id).await,
            Err(RemoteError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn commit_with_missing_blocks_is_rejected() {
        let (drive, _dir) = drive().await;
        let draft = drive.create_draft(&request("e.jpg")).await.unwrap();
        let commit = RevisionCommit {
            link_id: draft.link_id.clone(),
            revision_id: draft.revision_id.clone(),
            block_hashes: vec!["missing".into()],
            manifest_signature: "manifest".into(),
            content_hash: "keyed".into(),
            size_bytes: 1,
        };
        assert!(matches!(
            drive.commit_revision(&commit).await,
            Err(RemoteError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn delete_draft_removes_rows_and_payloads() {
        let (drive, dir) = drive().await;
        let draft = drive.create_draft(&request("f.jpg")).await.unwrap();
        let slots = drive
            .request_block_slots(&draft.link_id, &draft.revision_id, &[slot_request(1, b"x")])
            .await
            .unwrap();
        drive.transfer_block(&slots[0], Bytes::from_static(b"x")).await.unwrap();
        let path = drive.block_path(&draft.revision_id, 1);
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        drive.delete_draft(&draft.link_id, &draft.revision_id).await.unwrap();
        assert!(!path.exists());
        assert_eq!(drive.link_count().await.unwrap(), 0);
        drive.delete_draft(&draft.link_id, &draft.revision_id).await.unwrap();
    }

    async fn commit_single_block(drive: &FsDrive, draft: &Draft, data: &'static [u8], hash: &str) {
        let req = slot_request(1, data);
        let slots = drive
            .request_block_slots(&draft.link_id, &draft.revision_id, &[req.clone()])
            .await
            .unwrap();
        drive
            .transfer_block(&slots[0], Bytes::from_static(data))
            .await
            .unwrap();
        drive
            .commit_revision(&RevisionCommit {
                link_id: draft.link_id.clone(),
                revision_id: draft.revision_id.clone(),
                block_hashes: vec![req.hash],
                manifest_signature: format!("manifest-{}", draft.revision_id),
                content_hash: hash.into(),
                size_bytes: data.len() as u64,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn new_revision_supersedes_the_active_one() {
        let (drive, _dir) = drive().await;
        let first = drive.create_draft(&request("g.jpg")).await.unwrap();
        assert!(matches!(
            drive.create_revision(&first.link_id, "edit").await,
            Err(RemoteError::Conflict(_))
        ));
        commit_single_block(&drive, &first, b"v1", "hash-v1").await;

        let second = drive.create_revision(&first.link_id, "edit").await.unwrap();
        assert_eq!(second.link_id, first.link_id);
        assert!(matches!(
            drive.create_revision(&first.link_id, "other").await,
            Err(RemoteError::Conflict(_))
        ));
        let found = drive
            .find_draft("vol", "photos", "edit")
            .await
            .unwrap();
        assert_eq!(found, Some(second.clone()));

        commit_single_block(&drive, &second, b"v2", "hash-v2").await;
        let old = drive
            .get_revision(&first.link_id, &first.revision_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.state, RevisionState::Obsolete);
        assert_eq!(drive.revision_count(&first.link_id).await.unwrap(), 2);
        assert_eq!(drive.link_count().await.unwrap(), 1);
        assert_eq!(drive.find_by_hash("vol", "photos", "hash-v1").await.unwrap(), None);
        assert!(drive.find_by_hash("vol", "photos", "hash-v2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deleting_a_new_revision_keeps_the_committed_file() {
        let (drive, _dir) = drive().await;
        let first = drive.create_draft(&request("h.jpg")).await.unwrap();
        commit_single_block(&drive, &first, b"v1", "hash-v1").await;
        let second = drive.create_revision(&first.link_id, "edit").await.unwrap();

        drive.delete_draft(&second.link_id, &second.revision_id).await.unwrap();
        assert_eq!(drive.link_count().await.unwrap(), 1);
        assert_eq!(drive.revision_count(&first.link_id).await.unwrap(), 1);
        assert!(drive.find_by_hash("vol", "photos", "hash-v1").await.unwrap().is_some());
        assert!(matches!(
            drive.create_revision("missing", "edit").await,
            Err(RemoteError::NotFound(_))
        ));
    }
}
