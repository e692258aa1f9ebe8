//! Represents units of work held by the durable queue.

use crate::models::upload_unit::NetworkPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What a work item asks the engine to do.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkPayload {
    /// Drive one upload unit through the state machine.
    Upload { unit_id: i64 },
    /// Turn a submitted bulk into upload units.
    MaterializeBulk { bulk_id: Uuid },
    /// Scan a backup folder for new candidates.
    ScanFolder { folder_id: String },
}

impl WorkPayload {
    /// Logical key; at most one item per key is pending or running.
    pub fn key(&self) -> String {
        match self {
            Self::Upload { unit_id } => format!("upload:{unit_id}"),
            Self::MaterializeBulk { bulk_id } => format!("bulk:{bulk_id}"),
            Self::ScanFolder { folder_id } => format!("scan:{folder_id}"),
        }
    }

    /// False for work that only touches local files and the database; it
    /// runs whatever the connectivity.
    pub fn needs_network(&self) -> bool {
        matches!(self, Self::Upload { .. })
    }

    /// Policy applied when the key is already queued.
    pub fn existing_policy(&self) -> ExistingWorkPolicy {
        match self {
            Self::ScanFolder { .. } => ExistingWorkPolicy::AppendOrReplace,
            Self::Upload { .. } | Self::MaterializeBulk { .. } => ExistingWorkPolicy::Keep,
        }
    }
}

/// Uniqueness policy for work enqueued under an existing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistingWorkPolicy {
    /// Latest request wins; a running item is re-run with the new payload.
    AppendOrReplace,
    /// The existing item stays; the new request is dropped.
    Keep,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkState {
    Pending,
    Running,
}

/// A durable queue row.
#[derive(Clone, FromRow, Debug)]
pub struct WorkItem {
    pub id: i64,
    pub work_key: String,
    /// JSON-encoded [`WorkPayload`].
    pub payload: String,
    pub priority: i64,
    pub network: NetworkPolicy,
    pub state: WorkState,
    /// Retryable failures counted against the budget.
    pub attempts: i64,
    pub rerun: bool,
    /// Unix milliseconds before which the item is not dispatched.
    pub not_before: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn payload(&self) -> serde_json::Result<WorkPayload> {
        serde_json::from_str(&self.payload)
    }
}
