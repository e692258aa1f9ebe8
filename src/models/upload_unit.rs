//! Represents one candidate local file being backed up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of an upload unit.
///
/// Stages run strictly in declaration order; `Failed` and `Cancelled` are
/// reachable from any non-terminal state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum UploadState {
    Unprocessed,
    CreatingRemoteFile,
    EncryptingBlocks,
    RequestingTransferSlots,
    TransferringBlocks,
    FinalizingRevision,
    CleaningUp,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::CreatingRemoteFile => "creating_remote_file",
            Self::EncryptingBlocks => "encrypting_blocks",
            Self::RequestingTransferSlots => "requesting_transfer_slots",
            Self::TransferringBlocks => "transferring_blocks",
            Self::FinalizingRevision => "finalizing_revision",
            Self::CleaningUp => "cleaning_up",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// True once the remote revision has been committed; cancellation no
    /// longer rolls anything back past this point.
    pub fn is_committed(self) -> bool {
        matches!(self, Self::CleaningUp | Self::Completed)
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for the upload. User-initiated work is dispatched first.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Priority {
    User,
    Backup,
}

impl Priority {
    /// Sort rank used by the work queue (lower dispatches first).
    pub fn rank(self) -> i64 {
        match self {
            Self::User => 0,
            Self::Backup => 10,
        }
    }
}

/// Connectivity an upload is allowed to use.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Any,
    UnmeteredOnly,
}

/// What happens to staged block artifacts once the upload succeeds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Promote artifacts to permanent storage as an offline copy.
    Keep,
    /// Delete artifacts.
    Discard,
}

/// A single upload unit row.
///
/// The row is the authoritative record of pipeline progress: workers receive
/// only the id and re-fetch before every stage.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadUnit {
    /// Durable id, stable across restarts.
    pub id: i64,

    pub user_id: String,

    pub volume_id: String,

    /// Remote folder the file is uploaded into.
    pub parent_id: String,

    /// Opaque locator of the local source (`file://` URI or plain path).
    pub source_uri: String,

    /// File name used for the remote link.
    pub name: String,

    /// Declared size in bytes.
    pub size_bytes: i64,

    pub mime_type: String,

    pub priority: Priority,

    pub network: NetworkPolicy,

    pub state: UploadState,

    /// Stage that was active when the unit failed; retry resumes here.
    pub failed_stage: Option<UploadState>,

    /// Remote link id once the placeholder exists.
    pub link_id: Option<String>,

    /// Draft revision id that receives the blocks.
    pub revision_id: Option<String>,

    /// Keyed content hash in the target folder, computed by the duplicate check.
    pub content_hash: Option<String>,

    /// Plain digest of the source taken together with `content_hash`; the
    /// encrypted blocks must come from the same bytes.
    pub local_digest: Option<String>,

    /// Plaintext block size used when the blocks were planned.
    pub block_size: Option<i64>,

    /// Number of blocks the revision must contain.
    pub block_count: Option<i64>,

    pub delete_source: bool,

    pub cache_policy: CachePolicy,

    /// Durable cancellation marker, observed at the next stage boundary.
    pub cancel_requested: bool,

    pub last_error: Option<String>,

    /// Bulk this unit was materialized from.
    pub bulk_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a new unit.
#[derive(Clone, Debug)]
pub struct NewUploadUnit {
    pub user_id: String,
    pub volume_id: String,
    pub parent_id: String,
    pub source_uri: String,
    pub name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub priority: Priority,
    pub network: NetworkPolicy,
    pub delete_source: bool,
    pub cache_policy: CachePolicy,
    pub bulk_id: Option<Uuid>,
}

/// Record of a finished upload, kept after the unit row is removed.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BackupRecord {
    pub user_id: String,
    pub volume_id: String,
    pub parent_id: String,
    pub source_uri: String,
    pub size_bytes: i64,
    pub link_id: String,
    pub revision_id: Option<String>,
    /// True when the content already existed remotely and no bytes were sent.
    pub attached: bool,
    pub bytes_sent: i64,
    pub completed_at: DateTime<Utc>,
}
