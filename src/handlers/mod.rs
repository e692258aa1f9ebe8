//! HTTP handlers and the state they share.

use crate::services::engine::Engine;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

pub mod health_handlers;
pub mod upload_handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub db: Arc<SqlitePool>,
    pub cache_dir: PathBuf,
    pub permanent_dir: PathBuf,
}
