use crate::models::{
    revision::{CipherBlock, Draft, RemoteFileRef, Revision},
    upload_unit::{CachePolicy, NetworkPolicy, NewUploadUnit, Priority},
};
use crate::services::{
    crypto::{CryptoError, CryptoProvider, EncryptionContext, HashKey, LocalKeyring},
    digest_service::{self, DigestAlgorithm},
    engine::Engine,
    events::EventBus,
    fs_drive::FsDrive,
    remote::{
        BlockSlot, BlockSlotRequest, DraftRequest, RemoteDrive, RemoteError, RemoteResult,
        RevisionCommit,
    },
    retry::RetryPolicy,
    upload_pipeline::{PipelineSettings, UploadPipeline},
    upload_store::{self, UploadStore},
    work_queue::{NetworkClass, QueueSettings},
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use futures::future::BoxFuture;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

/// Plaintext block size used by test pipelines is 90% of this.
pub const TEST_BLOCK_LIMIT: u64 = 100;

/// Migrated in-memory database. A single connection that never expires,
/// otherwise every new connection would see an empty database.
pub async fn test_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    upload_store::migrate(&pool).await.expect("schema applies");
    Arc::new(pool)
}

/// Keyring whose folder keys can be withheld, counting encryptions.
pub struct TestCrypto {
    inner: LocalKeyring,
    locked: DashSet<String>,
    encryptions: AtomicUsize,
}

impl TestCrypto {
    pub fn new() -> Self {
        Self {
            inner: LocalKeyring::new([7u8; 32]),
            locked: DashSet::new(),
            encryptions: AtomicUsize::new(0),
        }
    }

    pub fn lock_folder(&self, folder_id: &str) {
        self.locked.insert(folder_id.to_string());
    }

    pub fn unlock_folder(&self, folder_id: &str) {
        self.locked.remove(folder_id);
    }

    pub fn encryptions(&self) -> usize {
        self.encryptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CryptoProvider for TestCrypto {
    async fn folder_hash_key(
        &self,
        volume_id: &str,
        folder_id: &str,
    ) -> Result<HashKey, CryptoError> {
        if self.locked.contains(folder_id) {
            return Err(CryptoError::FolderKeyUnavailable {
                volume_id: volume_id.to_string(),
                folder_id: folder_id.to_string(),
            });
        }
        self.inner.folder_hash_key(volume_id, folder_id).await
    }

    async fn encrypt_block(
        &self,
        index: u32,
        plaintext: &[u8],
        ctx: &EncryptionContext,
    ) -> Result<CipherBlock, CryptoError> {
        self.encryptions.fetch_add(1, Ordering::SeqCst);
        self.inner.encrypt_block(index, plaintext, ctx).await
    }

    async fn sign_manifest(
        &self,
        ctx: &EncryptionContext,
        block_hashes: &[String],
    ) -> Result<String, CryptoError> {
        self.inner.sign_manifest(ctx, block_hashes).await
    }
}

/// Remote calls a test can run code after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveCall {
    FindByHash,
    CreateDraft,
}

type CallHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// `FsDrive` with injectable faults and transfer accounting.
pub struct FaultyDrive {
    pub inner: FsDrive,
    hooks: Mutex<HashMap<DriveCall, CallHook>>,
    failing_transfers: AtomicU32,
    failing_index: Mutex<Option<u32>>,
    lost_commit_acks: AtomicU32,
    transferred: Mutex<Vec<u32>>,
    bytes: AtomicU64,
}

impl FaultyDrive {
    pub fn new(inner: FsDrive) -> Self {
        Self {
            inner,
            hooks: Mutex::new(HashMap::new()),
            failing_transfers: AtomicU32::new(0),
            failing_index: Mutex::new(None),
            lost_commit_acks: AtomicU32::new(0),
            transferred: Mutex::new(Vec::new()),
            bytes: AtomicU64::new(0),
        }
    }

    /// Run `hook` once, right after the next successful `call` and before
    /// its result reaches the caller.
    pub fn after<F>(&self, call: DriveCall, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.hooks.lock().unwrap().insert(call, Box::new(hook));
    }

    async fn run_hook(&self, call: DriveCall) {
        let hook = self.hooks.lock().unwrap().remove(&call);
        if let Some(hook) = hook {
            hook().await;
        }
    }

    /// Time out the next `n` block transfers.
    pub fn fail_next_transfers(&self, n: u32) {
        self.failing_transfers.store(n, Ordering::SeqCst);
    }

    /// Time out every transfer of block `index` until cleared.
    pub fn fail_block(&self, index: Option<u32>) {
        *self.failing_index.lock().unwrap() = index;
    }

    /// Apply the next `n` commits but report a timeout.
    pub fn lose_commit_acks(&self, n: u32) {
        self.lost_commit_acks.store(n, Ordering::SeqCst);
    }

    /// Indices of successful transfers, in completion order.
    pub fn transferred(&self) -> Vec<u32> {
        self.transferred.lock().unwrap().clone()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.transferred.lock().unwrap().clear();
        self.bytes.store(0, Ordering::SeqCst);
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteDrive for FaultyDrive {
    async fn find_by_hash(
        &self,
        volume_id: &str,
        parent_id: &str,
        content_hash: &str,
    ) -> RemoteResult<Option<RemoteFileRef>> {
        let found = self.inner.find_by_hash(volume_id, parent_id, content_hash).await?;
        self.run_hook(DriveCall::FindByHash).await;
        Ok(found)
    }

    async fn create_draft(&self, request: &DraftRequest) -> RemoteResult<Draft> {
        let draft = self.inner.create_draft(request).await?;
        self.run_hook(DriveCall::CreateDraft).await;
        Ok(draft)
    }

    async fn create_revision(&self, link_id: &str, client_uid: &str) -> RemoteResult<Draft> {
        self.inner.create_revision(link_id, client_uid).await
    }

    async fn find_draft(
        &self,
        volume_id: &str,
        parent_id: &str,
        client_uid: &str,
    ) -> RemoteResult<Option<Draft>> {
        self.inner.find_draft(volume_id, parent_id, client_uid).await
    }

    async fn request_block_slots(
        &self,
        link_id: &str,
        revision_id: &str,
        blocks: &[BlockSlotRequest],
    ) -> RemoteResult<Vec<BlockSlot>> {
        self.inner
            .request_block_slots(link_id, revision_id, blocks)
            .await
    }

    async fn transfer_block(&self, slot: &BlockSlot, data: Bytes) -> RemoteResult<()> {
        if Self::take_fault(&self.failing_transfers)
            || *self.failing_index.lock().unwrap() == Some(slot.index)
        {
            return Err(RemoteError::Timeout);
        }
        let len = data.len() as u64;
        self.inner.transfer_block(slot, data).await?;
        self.transferred.lock().unwrap().push(slot.index);
        self.bytes.fetch_add(len, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_revision(&self, commit: &RevisionCommit) -> RemoteResult<()> {
        self.inner.commit_revision(commit).await?;
        if Self::take_fault(&self.lost_commit_acks) {
            return Err(RemoteError::Timeout);
        }
        Ok(())
    }

    async fn get_revision(
        &self,
        link_id: &str,
        revision_id: &str,
    ) -> RemoteResult<Option<Revision>> {
        self.inner.get_revision(link_id, revision_id).await
    }

    async fn delete_draft(&self, link_id: &str, revision_id: &str) -> RemoteResult<()> {
        self.inner.delete_draft(link_id, revision_id).await
    }
}

/// Temp directories, a database, a keyring and a drive wired together.
pub struct TestEnv {
    pub dir: TempDir,
    pub db: Arc<SqlitePool>,
    pub store: UploadStore,
    pub crypto: Arc<TestCrypto>,
    pub remote: Arc<FaultyDrive>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = test_pool().await;
        let drive = FsDrive::new(db.clone(), dir.path().join("remote"), 4096);
        Self {
            store: UploadStore::new(db.clone()),
            crypto: Arc::new(TestCrypto::new()),
            remote: Arc::new(FaultyDrive::new(drive)),
            db,
            dir,
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn permanent_dir(&self) -> PathBuf {
        self.dir.path().join("permanent")
    }

    /// Write a local source file and return its uri.
    pub async fn write_source(&self, name: &str, bytes: &[u8]) -> String {
        let sources = self.dir.path().join("sources");
        tokio::fs::create_dir_all(&sources).await.unwrap();
        let path = sources.join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        format!("file://{}", path.display())
    }

    /// Commit an empty revision whose content hash is that of `bytes` in `parent`.
    pub async fn seed_remote_file(&self, parent: &str, name: &str, bytes: &[u8]) -> String {
        let draft = self
            .remote
            .inner
            .create_draft(&DraftRequest {
                volume_id: "vol".into(),
                parent_id: parent.into(),
                name: name.into(),
                mime_type: "image/jpeg".into(),
                client_uid: format!("seed-{name}"),
            })
            .await
            .unwrap();
        let key = self.crypto.inner.folder_hash_key("vol", parent).await.unwrap();
        self.remote
            .inner
            .commit_revision(&RevisionCommit {
                link_id: draft.link_id.clone(),
                revision_id: draft.revision_id,
                block_hashes: Vec::new(),
                manifest_signature: "seeded".into(),
                content_hash: digest_service::keyed_hash(&key, bytes).unwrap(),
                size_bytes: bytes.len() as u64,
            })
            .await
            .unwrap();
        draft.link_id
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            cache_dir: self.cache_dir(),
            permanent_dir: self.permanent_dir(),
            declared_max_block_size: TEST_BLOCK_LIMIT,
            transfer_page_size: 2,
            transfer_concurrency: 1,
            digest_algorithm: DigestAlgorithm::Md5,
        }
    }

    pub fn pipeline(&self) -> (UploadPipeline, EventBus) {
        let events = EventBus::new();
        let pipeline = UploadPipeline::new(
            self.store.clone(),
            self.remote.clone(),
            self.crypto.clone(),
            events.clone(),
            self.pipeline_settings(),
        );
        (pipeline, events)
    }

    pub fn engine(&self, backlog_threshold: i64) -> Arc<Engine> {
        Engine::new(
            self.db.clone(),
            self.remote.clone(),
            self.crypto.clone(),
            self.pipeline_settings(),
            QueueSettings {
                workers: 2,
                backlog_threshold,
                poll_interval: Duration::from_millis(20),
                retry: RetryPolicy::test(),
            },
            NetworkClass::Unmetered,
        )
    }

    /// Insert a user-priority unit for `uri` into folder `photos`.
    pub async fn new_unit(&self, uri: &str, name: &str, size: usize) -> i64 {
        self.store
            .insert_unit(&NewUploadUnit {
                user_id: "alice".into(),
                volume_id: "vol".into(),
                parent_id: "photos".into(),
                source_uri: uri.into(),
                name: name.into(),
                size_bytes: size as i64,
                mime_type: "image/jpeg".into(),
                priority: Priority::User,
                network: NetworkPolicy::Any,
                delete_source: false,
                cache_policy: CachePolicy::Discard,
                bulk_id: None,
            })
            .await
            .unwrap()
            .unit_id()
    }
}
