//! src/services/upload_pipeline.rs
//!
//! UploadPipeline: drives one upload unit through its stages:
//! duplicate check, remote placeholder, block encryption, slot requests,
//! paged block transfer, revision commit and cleanup.
//!
//! The unit row is re-fetched before every stage, so resuming after a crash
//! runs exactly the same code as a cold start. Every stage change is a
//! compare-and-set in the store; a refused change means somebody else
//! (cancellation) got there first and the loop simply looks again.

use crate::models::{
    raw_block::RawBlock,
    revision::{Draft, RevisionState},
    upload_unit::{BackupRecord, CachePolicy, UploadState, UploadUnit},
};
use crate::services::{
    block_splitter::{self, BlockError, BlockSplitter},
    cache_mover::{CacheMover, RevisionKey},
    crypto::{CryptoProvider, EncryptionContext},
    digest_service::DigestAlgorithm,
    duplicate_detector::DuplicateDetector,
    events::{EventBus, UploadEvent},
    failure::{PipelineError, UploadError},
    remote::{BlockSlot, BlockSlotRequest, DraftRequest, RemoteDrive, RemoteError, RevisionCommit},
    upload_store::UploadStore,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cache_dir: PathBuf,
    pub permanent_dir: PathBuf,
    /// Largest block the remote accepts; plaintext blocks use 90% of it.
    pub declared_max_block_size: u64,
    /// Blocks announced per slot request.
    pub transfer_page_size: usize,
    /// Blocks of one unit in flight at once.
    pub transfer_concurrency: usize,
    pub digest_algorithm: DigestAlgorithm,
}

/// How a run of the pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { attached: bool },
    Cancelled,
    /// The run was interrupted without a cancellation request; the unit
    /// resumes from its recorded stage next time.
    Suspended,
    /// Nothing to do: the unit is gone or failed.
    Idle,
}

enum Step {
    Continue,
    Done(RunOutcome),
}

pub struct UploadPipeline {
    store: UploadStore,
    remote: Arc<dyn RemoteDrive>,
    crypto: Arc<dyn CryptoProvider>,
    detector: DuplicateDetector,
    splitter: BlockSplitter,
    mover: CacheMover,
    events: EventBus,
    settings: PipelineSettings,
}

impl UploadPipeline {
    pub fn new(
        store: UploadStore,
        remote: Arc<dyn RemoteDrive>,
        crypto: Arc<dyn CryptoProvider>,
        events: EventBus,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            detector: DuplicateDetector::new(
                crypto.clone(),
                remote.clone(),
                settings.digest_algorithm,
            ),
            splitter: BlockSplitter::new(crypto.clone(), settings.declared_max_block_size),
            mover: CacheMover::new(&settings.cache_dir, &settings.permanent_dir),
            store,
            remote,
            crypto,
            events,
            settings,
        }
    }

    pub fn mover(&self) -> &CacheMover {
        &self.mover
    }

    /// Run unit `unit_id` until it completes, is cancelled, fails or is
    /// interrupted through `cancel`.
    pub async fn run(
        &self,
        unit_id: i64,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, UploadError> {
        loop {
            let unit = self
                .store
                .get_unit(unit_id)
                .await
                .map_err(|e| UploadError::new(unit_id, UploadState::Unprocessed, e))?;
            let Some(unit) = unit else {
                return Ok(RunOutcome::Idle);
            };
            let stage = unit.state;

            if unit.cancel_requested && !stage.is_committed() {
                return match self.cancel_cleanup(&unit).await {
                    Ok(Step::Done(outcome)) => Ok(outcome),
                    Ok(Step::Continue) => continue,
                    Err(err) => Err(UploadError::new(unit_id, stage, err)),
                };
            }
            if cancel.is_cancelled() {
                debug!(unit_id, stage = %stage, "run interrupted");
                return Ok(RunOutcome::Suspended);
            }

            let step = match stage {
                UploadState::Unprocessed => self.check_duplicate(&unit).await,
                UploadState::CreatingRemoteFile => self.create_remote_file(&unit).await,
                UploadState::EncryptingBlocks => self.encrypt_blocks(&unit, cancel).await,
                UploadState::RequestingTransferSlots | UploadState::TransferringBlocks => {
                    self.transfer_blocks(&unit, cancel).await
                }
                UploadState::FinalizingRevision => self.finalize_revision(&unit).await,
                UploadState::CleaningUp => self.clean_up(&unit).await,
                UploadState::Completed | UploadState::Failed | UploadState::Cancelled => {
                    Ok(Step::Done(RunOutcome::Idle))
                }
            };
            match step.map_err(|e| UploadError::new(unit_id, stage, e))? {
                Step::Continue => continue,
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    fn stage_changed(&self, unit: &UploadUnit, to: UploadState) {
        info!(unit_id = unit.id, from = %unit.state, stage = %to, "stage advanced");
        self.events.emit(UploadEvent::StageChanged {
            unit_id: unit.id,
            state: to,
        });
    }

    async fn advance(&self, unit: &UploadUnit, to: UploadState) -> Result<(), PipelineError> {
        if self.store.transition(unit.id, unit.state, to).await? {
            self.stage_changed(unit, to);
        }
        Ok(())
    }

    fn revision_of(unit: &UploadUnit) -> Result<(String, String), PipelineError> {
        match (&unit.link_id, &unit.revision_id) {
            (Some(link), Some(revision)) => Ok((link.clone(), revision.clone())),
            _ => Err(PipelineError::Validation(format!(
                "unit {} reached {} without a remote placeholder",
                unit.id, unit.state
            ))),
        }
    }

    fn context(unit: &UploadUnit, link_id: &str, revision_id: &str) -> EncryptionContext {
        EncryptionContext {
            volume_id: unit.volume_id.clone(),
            link_id: link_id.to_string(),
            revision_id: revision_id.to_string(),
        }
    }

    fn revision_key(unit: &UploadUnit, revision_id: &str) -> RevisionKey {
        RevisionKey::new(&unit.user_id, &unit.volume_id, revision_id)
    }

    fn client_uid(unit: &UploadUnit) -> String {
        format!("unit-{}-{}", unit.id, unit.created_at.timestamp_micros())
    }

    // ---- stages ---------------------------------------------------------

    async fn check_duplicate(&self, unit: &UploadUnit) -> Result<Step, PipelineError> {
        self.events.emit(UploadEvent::Preparing { unit_id: unit.id });
        let check = self
            .detector
            .check(&unit.volume_id, &unit.parent_id, &unit.source_uri)
            .await?;

        if let Some(existing) = check.existing {
            info!(
                unit_id = unit.id,
                link_id = %existing.link_id,
                "content already backed up, attaching"
            );
            let record = BackupRecord {
                user_id: unit.user_id.clone(),
                volume_id: unit.volume_id.clone(),
                parent_id: unit.parent_id.clone(),
                source_uri: unit.source_uri.clone(),
                size_bytes: check.digest.size_bytes as i64,
                link_id: existing.link_id,
                revision_id: None,
                attached: true,
                bytes_sent: 0,
                completed_at: Utc::now(),
            };
            if !self.store.complete_unit(unit.id, &record).await? {
                debug!(unit_id = unit.id, "unit changed before attaching, looking again");
                return Ok(Step::Continue);
            }
            self.delete_source_if_requested(unit).await;
            self.events.emit(UploadEvent::Completed {
                unit_id: unit.id,
                attached: true,
            });
            return Ok(Step::Done(RunOutcome::Completed { attached: true }));
        }

        if self
            .store
            .begin_upload(unit.id, &check.content_hash, &check.digest.local)
            .await?
        {
            self.stage_changed(unit, UploadState::CreatingRemoteFile);
        }
        Ok(Step::Continue)
    }

    /// Draft for `unit`: a new revision of the file this source was backed
    /// up to before, or a new file.
    async fn open_draft(
        &self,
        unit: &UploadUnit,
        previous_link: Option<&str>,
        client_uid: &str,
    ) -> Result<Draft, RemoteError> {
        if let Some(link_id) = previous_link {
            match self.remote.create_revision(link_id, client_uid).await {
                Err(RemoteError::NotFound(_)) => {
                    debug!(unit_id = unit.id, link_id, "backed-up file is gone, creating a new one");
                }
                other => return other,
            }
        }
        self.remote
            .create_draft(&DraftRequest {
                volume_id: unit.volume_id.clone(),
                parent_id: unit.parent_id.clone(),
                name: unit.name.clone(),
                mime_type: unit.mime_type.clone(),
                client_uid: client_uid.to_string(),
            })
            .await
    }

    async fn create_remote_file(&self, unit: &UploadUnit) -> Result<Step, PipelineError> {
        let client_uid = Self::client_uid(unit);
        let previous = self
            .store
            .backup_record(&unit.user_id, &unit.parent_id, &unit.source_uri)
            .await?;
        let previous_link = previous.as_ref().map(|record| record.link_id.as_str());
        let draft = match self.open_draft(unit, previous_link, &client_uid).await {
            Ok(draft) => draft,
            Err(RemoteError::Conflict(reason)) => {
                // One reconciliation attempt: a draft we created before a
                // crash carries our client uid.
                let found = self
                    .remote
                    .find_draft(&unit.volume_id, &unit.parent_id, &client_uid)
                    .await?;
                match found {
                    Some(draft) => {
                        info!(unit_id = unit.id, link_id = %draft.link_id, "adopting existing draft");
                        draft
                    }
                    None => return Err(RemoteError::Conflict(reason).into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        if self
            .store
            .set_remote_draft(unit.id, &draft.link_id, &draft.revision_id)
            .await?
        {
            self.stage_changed(unit, UploadState::EncryptingBlocks);
        } else {
            // Cancelled meanwhile: the draft was never recorded, so drop it here.
            if let Err(err) = self
                .remote
                .delete_draft(&draft.link_id, &draft.revision_id)
                .await
            {
                warn!(unit_id = unit.id, link_id = %draft.link_id, "orphan draft not removed: {err}");
            }
        }
        Ok(Step::Continue)
    }

    async fn encrypt_blocks(
        &self,
        unit: &UploadUnit,
        cancel: &CancellationToken,
    ) -> Result<Step, PipelineError> {
        let (link_id, revision_id) = Self::revision_of(unit)?;
        let ctx = Self::context(unit, &link_id, &revision_id);
        let key = Self::revision_key(unit, &revision_id);
        let (size, count) = self.splitter.plan(&unit.source_uri).await?;
        debug!(unit_id = unit.id, size, count, "planning blocks");

        let mut blocks = Vec::with_capacity(count as usize);
        for index in 1..=count {
            if cancel.is_cancelled() {
                return Ok(Step::Continue);
            }
            let cipher = self
                .splitter
                .encrypt_from_source(&unit.source_uri, index, &ctx)
                .await?;
            let artifact = self
                .mover
                .stage_artifact(&key, index, &cipher.ciphertext)
                .await?;
            blocks.push(RawBlock {
                unit_id: unit.id,
                idx: i64::from(index),
                artifact: artifact.to_string_lossy().into_owned(),
                size_bytes: cipher.ciphertext.len() as i64,
                hash: cipher.hash,
                signature: cipher.signature,
            });
        }

        if let Some(expected) = unit.local_digest.as_deref()
            && self.detector.local_digest(&unit.source_uri).await? != expected
        {
            return Err(BlockError::SourceChanged {
                uri: unit.source_uri.clone(),
            }
            .into());
        }

        if self
            .store
            .plan_blocks(unit.id, self.splitter.block_size() as i64, &blocks)
            .await?
        {
            self.stage_changed(unit, UploadState::RequestingTransferSlots);
        }
        Ok(Step::Continue)
    }

    /// Re-encrypt blocks whose cached artifact disappeared.
    async fn ensure_artifacts(
        &self,
        unit: &UploadUnit,
        ctx: &EncryptionContext,
        page: Vec<RawBlock>,
    ) -> Result<Vec<RawBlock>, PipelineError> {
        let key = Self::revision_key(unit, &ctx.revision_id);
        let mut ready = Vec::with_capacity(page.len());
        for block in page {
            if fs::metadata(&block.artifact).await.is_ok() {
                ready.push(block);
                continue;
            }
            let index = block.idx as u32;
            warn!(unit_id = unit.id, index, "cached block missing, re-encrypting");
            let cipher = self
                .splitter
                .encrypt_from_source(&unit.source_uri, index, ctx)
                .await?;
            let artifact = self
                .mover
                .stage_artifact(&key, index, &cipher.ciphertext)
                .await?;
            let rebuilt = RawBlock {
                artifact: artifact.to_string_lossy().into_owned(),
                size_bytes: cipher.ciphertext.len() as i64,
                hash: cipher.hash,
                signature: cipher.signature,
                ..block
            };
            self.store.replace_block(&rebuilt).await?;
            ready.push(rebuilt);
        }
        Ok(ready)
    }

    async fn transfer_blocks(
        &self,
        unit: &UploadUnit,
        cancel: &CancellationToken,
    ) -> Result<Step, PipelineError> {
        let (link_id, revision_id) = Self::revision_of(unit)?;
        let ctx = Self::context(unit, &link_id, &revision_id);
        let mut stage = unit.state;
        let page_size = self.settings.transfer_page_size.max(1) as i64;

        loop {
            if cancel.is_cancelled() {
                return Ok(Step::Continue);
            }
            let page = self.store.pending_blocks(unit.id, page_size).await?;
            if page.is_empty() {
                break;
            }
            let page = self.ensure_artifacts(unit, &ctx, page).await?;
            let requests: Vec<BlockSlotRequest> = page
                .iter()
                .map(|block| BlockSlotRequest {
                    index: block.idx as u32,
                    size_bytes: block.size_bytes as u64,
                    hash: block.hash.clone(),
                    signature: block.signature.clone(),
                })
                .collect();
            let mut slots: HashMap<u32, BlockSlot> = self
                .remote
                .request_block_slots(&link_id, &revision_id, &requests)
                .await?
                .into_iter()
                .map(|slot| (slot.index, slot))
                .collect();
            debug!(unit_id = unit.id, blocks = slots.len(), "transfer slots granted");

            if stage == UploadState::RequestingTransferSlots {
                if !self
                    .store
                    .transition(unit.id, stage, UploadState::TransferringBlocks)
                    .await?
                {
                    return Ok(Step::Continue);
                }
                self.stage_changed(unit, UploadState::TransferringBlocks);
                stage = UploadState::TransferringBlocks;
            }

            let mut work = Vec::with_capacity(page.len());
            for block in page {
                let slot = slots.remove(&(block.idx as u32)).ok_or_else(|| {
                    PipelineError::Remote(RemoteError::Validation(format!(
                        "no transfer slot for block {}",
                        block.idx
                    )))
                })?;
                work.push((block, slot));
            }

            // In-flight blocks are drained even after a failure or a
            // cancellation; only blocks not yet started are skipped.
            let results: Vec<Result<bool, PipelineError>> = stream::iter(work)
                .map(|(block, slot)| self.transfer_one(unit, block, slot, cancel))
                .buffer_unordered(self.settings.transfer_concurrency.max(1))
                .collect()
                .await;
            for result in results {
                result?;
            }
        }

        if stage == UploadState::RequestingTransferSlots {
            if !self
                .store
                .transition(unit.id, stage, UploadState::TransferringBlocks)
                .await?
            {
                return Ok(Step::Continue);
            }
            self.stage_changed(unit, UploadState::TransferringBlocks);
            stage = UploadState::TransferringBlocks;
        }
        if self
            .store
            .transition(unit.id, stage, UploadState::FinalizingRevision)
            .await?
        {
            self.stage_changed(unit, UploadState::FinalizingRevision);
        }
        Ok(Step::Continue)
    }

    async fn transfer_one(
        &self,
        unit: &UploadUnit,
        block: RawBlock,
        slot: BlockSlot,
        cancel: &CancellationToken,
    ) -> Result<bool, PipelineError> {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let data = fs::read(&block.artifact).await.map_err(BlockError::Io)?;
        self.remote.transfer_block(&slot, Bytes::from(data)).await?;
        self.store.confirm_block(&block).await?;
        debug!(unit_id = unit.id, index = block.idx, "block confirmed");

        let confirmed = self.store.confirmed_bytes(unit.id).await?;
        self.events.emit(UploadEvent::Progress {
            unit_id: unit.id,
            bytes_confirmed: confirmed.min(unit.size_bytes),
            size_bytes: unit.size_bytes,
        });
        Ok(true)
    }

    async fn finalize_revision(&self, unit: &UploadUnit) -> Result<Step, PipelineError> {
        let (link_id, revision_id) = Self::revision_of(unit)?;
        let expected = unit.block_count.unwrap_or_default();
        let uploaded = self.store.uploaded_blocks(unit.id).await?;
        let contiguous = uploaded
            .iter()
            .enumerate()
            .all(|(pos, block)| block.idx == pos as i64 + 1);
        if uploaded.len() as i64 != expected || !contiguous {
            return Err(PipelineError::IncompleteRevision(format!(
                "{} of {expected} blocks confirmed for revision {revision_id}",
                uploaded.len()
            )));
        }
        let Some(content_hash) = unit.content_hash.clone() else {
            return Err(PipelineError::Validation(format!(
                "unit {} has no content hash",
                unit.id
            )));
        };

        let ctx = Self::context(unit, &link_id, &revision_id);
        let block_hashes: Vec<String> = uploaded.into_iter().map(|b| b.hash).collect();
        let manifest_signature = self.crypto.sign_manifest(&ctx, &block_hashes).await?;
        let commit = RevisionCommit {
            link_id: link_id.clone(),
            revision_id: revision_id.clone(),
            block_hashes,
            manifest_signature: manifest_signature.clone(),
            content_hash,
            size_bytes: unit.size_bytes as u64,
        };

        match self.remote.commit_revision(&commit).await {
            Ok(()) => {}
            Err(RemoteError::Conflict(reason)) => {
                let current = self.remote.get_revision(&link_id, &revision_id).await?;
                let ours = current.is_some_and(|revision| {
                    revision.state == RevisionState::Active
                        && revision.is_complete(expected as u32)
                        && revision.manifest_signature.as_deref() == Some(manifest_signature.as_str())
                });
                if !ours {
                    return Err(RemoteError::Conflict(reason).into());
                }
                info!(unit_id = unit.id, %revision_id, "revision already committed");
            }
            Err(err) => return Err(err.into()),
        }

        self.advance(unit, UploadState::CleaningUp).await?;
        Ok(Step::Continue)
    }

    async fn clean_up(&self, unit: &UploadUnit) -> Result<Step, PipelineError> {
        let (link_id, revision_id) = Self::revision_of(unit)?;
        let key = Self::revision_key(unit, &revision_id);
        match unit.cache_policy {
            CachePolicy::Keep => {
                self.mover.move_to_permanent(&key).await?;
            }
            CachePolicy::Discard => self.mover.purge(&key).await?,
        }

        let previous = self
            .store
            .backup_record(&unit.user_id, &unit.parent_id, &unit.source_uri)
            .await?;
        if let Some(old_revision) = previous.and_then(|record| record.revision_id)
            && old_revision != revision_id
        {
            let old_key = Self::revision_key(unit, &old_revision);
            if self.mover.move_to_cache(&old_key).await? {
                debug!(unit_id = unit.id, %old_revision, "superseded revision moved to cache");
            }
        }

        let bytes_sent = self.store.confirmed_bytes(unit.id).await?;
        let record = BackupRecord {
            user_id: unit.user_id.clone(),
            volume_id: unit.volume_id.clone(),
            parent_id: unit.parent_id.clone(),
            source_uri: unit.source_uri.clone(),
            size_bytes: unit.size_bytes,
            link_id,
            revision_id: Some(revision_id),
            attached: false,
            bytes_sent,
            completed_at: Utc::now(),
        };
        if !self.store.complete_unit(unit.id, &record).await? {
            return Ok(Step::Continue);
        }
        self.delete_source_if_requested(unit).await;
        info!(unit_id = unit.id, bytes_sent, "upload completed");
        self.events.emit(UploadEvent::Completed {
            unit_id: unit.id,
            attached: false,
        });
        Ok(Step::Done(RunOutcome::Completed { attached: false }))
    }

    async fn delete_source_if_requested(&self, unit: &UploadUnit) {
        if !unit.delete_source {
            return;
        }
        let path = block_splitter::source_path(&unit.source_uri);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(unit_id = unit.id, "source removed after upload"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(unit_id = unit.id, "could not remove source {}: {err}", path.display()),
        }
    }

    // ---- cancellation ---------------------------------------------------

    /// Remove everything a cancelled unit created, remotely first.
    async fn cancel_cleanup(&self, unit: &UploadUnit) -> Result<Step, PipelineError> {
        if let (Some(link_id), Some(revision_id)) = (&unit.link_id, &unit.revision_id) {
            match self.remote.delete_draft(link_id, revision_id).await {
                Ok(()) => {}
                Err(RemoteError::Conflict(_)) => {
                    // The revision was committed before the request landed;
                    // finish the upload instead.
                    info!(unit_id = unit.id, "cancel arrived after commit, completing");
                    self.advance(unit, UploadState::CleaningUp).await?;
                    return Ok(Step::Continue);
                }
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(revision_id) = &unit.revision_id {
            self.mover
                .purge(&Self::revision_key(unit, revision_id))
                .await?;
        }
        self.store.remove_unit(unit.id).await?;
        info!(unit_id = unit.id, stage = %unit.state, "upload cancelled");
        self.events.emit(UploadEvent::Cancelled { unit_id: unit.id });
        Ok(Step::Done(RunOutcome::Cancelled))
    }
}
