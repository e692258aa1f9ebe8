//! Core data models for the backup upload pipeline.
//!
//! These entities describe the durable state the pipeline drives: upload
//! units and their blocks, submitted bulks, watched backup folders, remote
//! revisions and queued work. They map to SQLite tables via `sqlx::FromRow`
//! and serialize as JSON via `serde` for the control API.

pub mod backup_folder;
pub mod bulk;
pub mod raw_block;
pub mod revision;
pub mod upload_unit;
pub mod work;
