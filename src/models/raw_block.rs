//! Represents blocks of a unit that are not yet confirmed server-side.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One encrypted block awaiting transfer.
///
/// The set of remaining rows for a unit is authoritative: a row is deleted
/// in the same transaction that records its confirmation.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct RawBlock {
    /// Parent upload unit.
    pub unit_id: i64,

    /// Sequence index (1-based, contiguous).
    pub idx: i64,

    /// Path of the encrypted artifact in the cache area.
    pub artifact: String,

    /// Ciphertext size in bytes.
    pub size_bytes: i64,

    /// Base64 BLAKE2b-256 digest of the ciphertext.
    pub hash: String,

    /// Base64 signature over the digest.
    pub signature: String,
}

/// A block confirmed by the remote, kept until the revision is finalized.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadedBlock {
    pub unit_id: i64,
    pub idx: i64,
    pub size_bytes: i64,
    pub hash: String,
}
