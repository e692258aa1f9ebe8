//! src/services/cache_mover.rs
//!
//! CacheMover: relocates the artifact directory of a revision between the
//! volatile cache area and permanent storage. Each (user, volume, revision)
//! has its own critical section; unrelated revisions never wait on each
//! other. A destination left behind by a crashed move is replaced, not merged.

use crate::services::failure::ErrorClass;
use dashmap::DashMap;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum MoveError {
    #[error("{op} `{path}`: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MoveError {
    fn io<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// Identifies the artifacts of one revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionKey {
    pub user_id: String,
    pub volume_id: String,
    pub revision_id: String,
}

impl RevisionKey {
    pub fn new(
        user_id: impl Into<String>,
        volume_id: impl Into<String>,
        revision_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            volume_id: volume_id.into(),
            revision_id: revision_id.into(),
        }
    }

    fn relative(&self) -> PathBuf {
        Path::new(&self.user_id)
            .join(&self.volume_id)
            .join(&self.revision_id)
    }
}

#[derive(Clone)]
pub struct CacheMover {
    cache_dir: PathBuf,
    permanent_dir: PathBuf,
    locks: Arc<DashMap<RevisionKey, Arc<Mutex<()>>>>,
}

impl CacheMover {
    pub fn new(cache_dir: impl Into<PathBuf>, permanent_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            permanent_dir: permanent_dir.into(),
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn cache_path(&self, key: &RevisionKey) -> PathBuf {
        self.cache_dir.join(key.relative())
    }

    pub fn permanent_path(&self, key: &RevisionKey) -> PathBuf {
        self.permanent_dir.join(key.relative())
    }

    /// Path of block `index` staged in the cache area.
    pub fn artifact_path(&self, key: &RevisionKey, index: u32) -> PathBuf {
        self.cache_path(key).join(format!("{index:06}.blk"))
    }

    fn lock_for(&self, key: &RevisionKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &RevisionKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Stage an encrypted block under the revision's cache directory.
    pub async fn stage_artifact(
        &self,
        key: &RevisionKey,
        index: u32,
        data: &[u8],
    ) -> Result<PathBuf, MoveError> {
        let path = self.artifact_path(key, index);
        let dir = self.cache_path(key);
        fs::create_dir_all(&dir)
            .await
            .map_err(MoveError::io("create", &dir))?;

        let tmp_path = path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)
            .await
            .map_err(MoveError::io("create", &tmp_path))?;
        let written = async {
            tmp.write_all(data).await?;
            tmp.flush().await?;
            tmp.sync_all().await
        }
        .await;
        drop(tmp);
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(MoveError::io("write", &tmp_path)(err));
        }
        fs::rename(&tmp_path, &path)
            .await
            .map_err(MoveError::io("rename", &path))?;
        Ok(path)
    }

    /// Move a revision's artifacts from the cache to permanent storage.
    pub async fn move_to_permanent(&self, key: &RevisionKey) -> Result<bool, MoveError> {
        let from = self.cache_path(key);
        let to = self.permanent_path(key);
        self.relocate(key, &from, &to).await
    }

    /// Move a revision's artifacts back from permanent storage to the cache.
    pub async fn move_to_cache(&self, key: &RevisionKey) -> Result<bool, MoveError> {
        let from = self.permanent_path(key);
        let to = self.cache_path(key);
        self.relocate(key, &from, &to).await
    }

    /// Remove a revision's artifacts from both areas.
    pub async fn purge(&self, key: &RevisionKey) -> Result<(), MoveError> {
        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().await;
            match remove_dir_if_exists(&self.cache_path(key)).await {
                Ok(()) => remove_dir_if_exists(&self.permanent_path(key)).await,
                Err(err) => Err(err),
            }
        };
        drop(lock);
        self.release(key);
        result
    }

    async fn relocate(&self, key: &RevisionKey, from: &Path, to: &Path) -> Result<bool, MoveError> {
        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().await;
            move_dir(from, to).await
        };
        drop(lock);
        self.release(key);
        result
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), MoveError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(MoveError::io("remove", path)(err)),
    }
}

/// Replace `to` with the contents of `from`. Returns false when there was
/// nothing to move.
async fn move_dir(from: &Path, to: &Path) -> Result<bool, MoveError> {
    if fs::metadata(from).await.is_err() {
        debug!("nothing to move at {}", from.display());
        return Ok(false);
    }
    remove_dir_if_exists(to).await?;
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(MoveError::io("create", parent))?;
    }

    match fs::rename(from, to).await {
        Ok(()) => {}
        // Different filesystems: copy into a staging dir, then swap it in.
        Err(_) => {
            let staging = to.with_extension("partial");
            remove_dir_if_exists(&staging).await?;
            copy_flat_dir(from, &staging).await?;
            fs::rename(&staging, to)
                .await
                .map_err(MoveError::io("rename", to))?;
            remove_dir_if_exists(from).await?;
        }
    }
    debug!("moved {} -> {}", from.display(), to.display());
    Ok(true)
}

async fn copy_flat_dir(from: &Path, to: &Path) -> Result<(), MoveError> {
    fs::create_dir_all(to)
        .await
        .map_err(MoveError::io("create", to))?;
    let mut entries = fs::read_dir(from)
        .await
        .map_err(MoveError::io("read", from))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(MoveError::io("read", from))?
    {
        let src = entry.path();
        let dst = to.join(entry.file_name());
        fs::copy(&src, &dst)
            .await
            .map_err(MoveError::io("copy", &src))?;
    }
    Ok(())
}
