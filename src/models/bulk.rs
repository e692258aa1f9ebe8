//! Represents an ordered batch of local files submitted together.

use crate::models::upload_unit::{CachePolicy, NetworkPolicy, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Description of one local file inside a bulk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub source_uri: String,
    pub name: String,
    pub size_bytes: i64,
    pub mime_type: String,
}

/// Submission payload for a bulk.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NewBulk {
    pub user_id: String,
    pub volume_id: String,
    pub parent_id: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default = "default_network")]
    pub network: NetworkPolicy,
    #[serde(default)]
    pub delete_source: bool,
    #[serde(default = "default_cache_policy")]
    pub cache_policy: CachePolicy,
    /// Descriptors in the order the caller supplied them.
    pub items: Vec<SourceDescriptor>,
}

fn default_priority() -> Priority {
    Priority::User
}

fn default_network() -> NetworkPolicy {
    NetworkPolicy::Any
}

fn default_cache_policy() -> CachePolicy {
    CachePolicy::Discard
}

/// Persisted bulk header.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BulkRow {
    pub id: Uuid,
    pub user_id: String,
    pub volume_id: String,
    pub parent_id: String,
    pub priority: Priority,
    pub network: NetworkPolicy,
    pub delete_source: bool,
    pub cache_policy: CachePolicy,
    pub created_at: DateTime<Utc>,
}

/// Persisted bulk item; `position` is the index in the submitted list.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BulkItemRow {
    pub bulk_id: Uuid,
    pub position: i64,
    pub source_uri: String,
    pub name: String,
    pub size_bytes: i64,
    pub mime_type: String,
}

impl From<BulkItemRow> for SourceDescriptor {
    fn from(row: BulkItemRow) -> Self {
        Self {
            source_uri: row.source_uri,
            name: row.name,
            size_bytes: row.size_bytes,
            mime_type: row.mime_type,
        }
    }
}

/// A bulk as read back from storage, with its not-yet-materialized items.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UploadBulk {
    #[serde(flatten)]
    pub header: BulkRow,
    pub items: Vec<SourceDescriptor>,
}
