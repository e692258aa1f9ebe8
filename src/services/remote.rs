//! Boundary to the remote drive.
//!
//! Only the calls the upload pipeline needs are modelled: hash lookup,
//! placeholder (draft) creation, new revisions of existing files, block
//! slot negotiation, block transfer and revision commit. Wire formats are the implementation's business.

use crate::models::revision::{Draft, RemoteFileRef, Revision};
use crate::services::failure::ErrorClass;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected by remote: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout | Self::Unavailable(_) | Self::RateLimited { .. } => {
                ErrorClass::Transient
            }
            Self::PermissionDenied(_) | Self::Validation(_) => ErrorClass::TerminalLocal,
            Self::QuotaExceeded | Self::NotFound(_) => ErrorClass::TerminalRemote,
            Self::Conflict(_) => ErrorClass::Conflict,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Request for a new link with an empty draft revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftRequest {
    pub volume_id: String,
    pub parent_id: String,
    pub name: String,
    pub mime_type: String,
    /// Stable per unit so a draft left behind by a crash can be recognised.
    pub client_uid: String,
}

/// Block announced to the remote before transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSlotRequest {
    pub index: u32,
    pub size_bytes: u64,
    pub hash: String,
    pub signature: String,
}

/// Where a block must be sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSlot {
    pub index: u32,
    pub url: String,
    pub hash: String,
}

/// Final commit of a draft revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionCommit {
    pub link_id: String,
    pub revision_id: String,
    /// Block hashes ordered by index 1..=N.
    pub block_hashes: Vec<String>,
    pub manifest_signature: String,
    /// Keyed content hash of the whole file in its parent folder.
    pub content_hash: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Active file in `parent_id` whose keyed content hash equals `content_hash`.
    async fn find_by_hash(
        &self,
        volume_id: &str,
        parent_id: &str,
        content_hash: &str,
    ) -> RemoteResult<Option<RemoteFileRef>>;

    /// Create a link placeholder with a draft revision. Fails with `Conflict`
    /// when the name is taken in the parent.
    async fn create_draft(&self, request: &DraftRequest) -> RemoteResult<Draft>;

    /// Add a draft revision to the existing file `link_id`. Fails with
    /// `NotFound` when the link is gone and with `Conflict` when the link
    /// already carries a draft revision.
    async fn create_revision(&self, link_id: &str, client_uid: &str) -> RemoteResult<Draft>;

    /// Draft revision created with `client_uid` on a file in `parent_id`,
    /// whether the file itself is a draft or already active.
    async fn find_draft(
        &self,
        volume_id: &str,
        parent_id: &str,
        client_uid: &str,
    ) -> RemoteResult<Option<Draft>>;

    /// Announce a page of blocks and receive their transfer slots.
    async fn request_block_slots(
        &self,
        link_id: &str,
        revision_id: &str,
        blocks: &[BlockSlotRequest],
    ) -> RemoteResult<Vec<BlockSlot>>;

    /// Send one block; `Ok` means the remote persisted it.
    async fn transfer_block(&self, slot: &BlockSlot, data: Bytes) -> RemoteResult<()>;

    /// Commit a draft revision. Committing the same revision id again never
    /// creates a second revision.
    async fn commit_revision(&self, commit: &RevisionCommit) -> RemoteResult<()>;

    async fn get_revision(&self, link_id: &str, revision_id: &str)
    -> RemoteResult<Option<Revision>>;

    /// Remove draft revision `revision_id` and everything uploaded for it.
    /// A link left without any committed revision is removed too. Fails
    /// with `Conflict` when the revision was already committed.
    async fn delete_draft(&self, link_id: &str, revision_id: &str) -> RemoteResult<()>;
}
