//! Finds new candidates in a backup folder.

use crate::models::{
    bulk::{NewBulk, SourceDescriptor},
    upload_unit::{CachePolicy, Priority},
};
use crate::services::{failure::ErrorClass, upload_store::UploadStore};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("unknown backup folder `{0}`")]
    UnknownFolder(String),
    #[error("walking `{path}`: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("scan store: {0}")]
    Store(#[from] sqlx::Error),
}

impl ScanError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownFolder(_) | Self::Walk { .. } => ErrorClass::TerminalLocal,
            Self::Join(_) | Self::Store(_) => ErrorClass::Transient,
        }
    }
}

/// Guess a mime type from the file extension.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

fn walk_sorted(root: &Path) -> Result<Vec<(PathBuf, u64)>, ScanError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| ScanError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|source| ScanError::Walk {
                path: entry.path().to_path_buf(),
                source,
            })?
            .len();
        files.push((entry.into_path(), size));
    }
    Ok(files)
}

#[derive(Clone)]
pub struct FolderScanner {
    store: UploadStore,
}

impl FolderScanner {
    pub fn new(store: UploadStore) -> Self {
        Self { store }
    }

    /// Build a backup bulk of the files in `folder_id` that are not backed
    /// up yet, in path order. `None` when the folder is disabled.
    pub async fn scan(&self, folder_id: &str) -> Result<Option<NewBulk>, ScanError> {
        let folder = self
            .store
            .get_backup_folder(folder_id)
            .await?
            .ok_or_else(|| ScanError::UnknownFolder(folder_id.to_string()))?;
        if !folder.enabled {
            debug!(folder_id, "folder disabled, skipping scan");
            return Ok(None);
        }

        let root = PathBuf::from(&folder.local_path);
        let files = tokio::task::spawn_blocking(move || walk_sorted(&root)).await??;

        let mut items = Vec::new();
        for (path, size) in files {
            let source_uri = format!("file://{}", path.display());
            let previous = self
                .store
                .backup_record(&folder.user_id, &folder.remote_folder_id, &source_uri)
                .await?;
            if previous.is_some_and(|record| record.size_bytes == size as i64) {
                continue;
            }
            items.push(SourceDescriptor {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                mime_type: mime_for(&path).to_string(),
                size_bytes: size as i64,
                source_uri,
            });
        }
        info!(folder_id, candidates = items.len(), "folder scanned");

        Ok(Some(NewBulk {
            user_id: folder.user_id,
            volume_id: folder.volume_id,
            parent_id: folder.remote_folder_id,
            priority: Priority::Backup,
            network: folder.network,
            delete_source: false,
            cache_policy: CachePolicy::Discard,
            items,
        }))
    }
}
