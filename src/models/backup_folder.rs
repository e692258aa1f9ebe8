//! Represents a watched local media bucket bound to a remote folder.

use crate::models::upload_unit::NetworkPolicy;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A local bucket whose files are backed up into `remote_folder_id`.
///
/// Rows are created by the setup flow; the pipeline only reads them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BackupFolder {
    pub id: String,
    pub user_id: String,
    pub volume_id: String,
    /// Platform media bucket identifier.
    pub bucket_id: i64,
    /// Directory scanned for candidates.
    pub local_path: String,
    pub remote_folder_id: String,
    pub network: NetworkPolicy,
    pub enabled: bool,
}
