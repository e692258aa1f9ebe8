//! src/services/engine.rs
//!
//! Engine: owns every pipeline component and the work queue, executes
//! queued work and exposes the command surface used by the HTTP layer.

use crate::models::{
    backup_folder::BackupFolder,
    bulk::{NewBulk, UploadBulk},
    upload_unit::{NetworkPolicy, Priority, UploadState, UploadUnit},
    work::{WorkPayload, WorkState},
};
use crate::services::{
    bulk_service::BulkService,
    crypto::CryptoProvider,
    events::{EventBus, Notification, UploadEvent},
    failure::{PipelineError, WorkError},
    folder_scanner::FolderScanner,
    remote::RemoteDrive,
    upload_pipeline::{PipelineSettings, UploadPipeline},
    upload_store::UploadStore,
    work_queue::{EnqueueOutcome, NetworkClass, QueueError, QueueSettings, WorkHandler, WorkQueue},
};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("upload unit {0} not found")]
    UnitNotFound(i64),
    #[error("bulk {0} not found")]
    BulkNotFound(Uuid),
    #[error("backup folder `{0}` not found")]
    FolderNotFound(String),
    #[error("unit {id} is {state}; only failed units can be retried")]
    NotRetryable { id: i64, state: UploadState },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("metadata store: {0}")]
    Store(#[from] sqlx::Error),
}

/// A unit with its transfer progress and queue status.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    #[serde(flatten)]
    pub unit: UploadUnit,
    pub bytes_confirmed: i64,
    pub pending_blocks: i64,
    pub queued: Option<WorkState>,
    pub attempts: i64,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Nothing existed remotely; local state is already gone.
    Removed,
    /// Remote cleanup is scheduled.
    Scheduled,
    /// The revision was already committed; the upload finishes normally.
    Ignored,
}

pub struct Engine {
    store: UploadStore,
    queue: Arc<WorkQueue>,
    pipeline: Arc<UploadPipeline>,
    bulks: BulkService,
    scanner: FolderScanner,
    events: EventBus,
}

impl Engine {
    pub fn new(
        db: Arc<SqlitePool>,
        remote: Arc<dyn RemoteDrive>,
        crypto: Arc<dyn CryptoProvider>,
        pipeline_settings: PipelineSettings,
        queue_settings: QueueSettings,
        network: NetworkClass,
    ) -> Arc<Self> {
        let store = UploadStore::new(db.clone());
        let events = EventBus::new();
        let queue = Arc::new(WorkQueue::new(db, queue_settings, events.clone(), network));
        let pipeline = Arc::new(UploadPipeline::new(
            store.clone(),
            remote,
            crypto,
            events.clone(),
            pipeline_settings,
        ));
        Arc::new(Self {
            bulks: BulkService::new(store.clone(), queue.clone()),
            scanner: FolderScanner::new(store.clone()),
            store,
            queue,
            pipeline,
            events,
        })
    }

    #[cfg(test)]
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    #[cfg(test)]
    pub fn pipeline(&self) -> &Arc<UploadPipeline> {
        &self.pipeline
    }

    /// Recover interrupted work, re-schedule every unfinished unit and bulk,
    /// then start dispatching.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, EngineError> {
        self.queue.recover().await?;
        self.resume().await?;
        Ok(self.queue.start(self.clone()))
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let mut units = 0;
        for id in self.store.active_unit_ids().await? {
            if let Some(unit) = self.store.get_unit(id).await? {
                self.enqueue_unit(&unit).await?;
                units += 1;
            }
        }
        let bulks = self.store.pending_bulks().await?;
        for bulk in &bulks {
            self.queue
                .enqueue(
                    &WorkPayload::MaterializeBulk { bulk_id: bulk.id },
                    bulk.priority.rank(),
                    NetworkPolicy::Any,
                )
                .await?;
        }
        info!(units, bulks = bulks.len(), "resumed unfinished work");
        Ok(())
    }

    async fn enqueue_unit(&self, unit: &UploadUnit) -> Result<EnqueueOutcome, QueueError> {
        self.queue
            .enqueue(
                &WorkPayload::Upload { unit_id: unit.id },
                unit.priority.rank(),
                unit.network,
            )
            .await
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub async fn submit_bulk(&self, bulk: &NewBulk) -> Result<Uuid, EngineError> {
        Ok(self.bulks.submit(bulk).await?)
    }

    pub async fn bulk(&self, id: Uuid) -> Result<UploadBulk, EngineError> {
        self.bulks
            .load(id)
            .await?
            .ok_or(EngineError::BulkNotFound(id))
    }

    pub async fn list_units(&self, user_id: &str) -> Result<Vec<UploadUnit>, EngineError> {
        Ok(self.store.list_units(user_id).await?)
    }

    pub async fn unit_status(&self, id: i64) -> Result<UnitStatus, EngineError> {
        let unit = self
            .store
            .get_unit(id)
            .await?
            .ok_or(EngineError::UnitNotFound(id))?;
        let bytes_confirmed = self.store.confirmed_bytes(id).await?.min(unit.size_bytes);
        let pending_blocks = self.store.count_pending_blocks(id).await?;
        let work = self
            .queue
            .status(&WorkPayload::Upload { unit_id: id }.key())
            .await?;
        Ok(UnitStatus {
            bytes_confirmed,
            pending_blocks,
            queued: work.as_ref().map(|w| w.state),
            attempts: work.map_or(0, |w| w.attempts),
            unit,
        })
    }

    /// Cancel a unit. The request is recorded durably first; whoever runs
    /// the unit next observes it.
    pub async fn cancel_unit(&self, id: i64) -> Result<CancelOutcome, EngineError> {
        let unit = self
            .store
            .request_cancel(id)
            .await?
            .ok_or(EngineError::UnitNotFound(id))?;
        if unit.state.is_committed() {
            info!(unit_id = id, state = %unit.state, "cancel ignored, revision committed");
            return Ok(CancelOutcome::Ignored);
        }

        let key = WorkPayload::Upload { unit_id: id }.key();
        self.queue.cancel(&key).await?;

        // Nothing exists remotely yet. A worker that creates a draft now
        // fails to record it and removes it again; one that recorded its
        // draft first keeps the row and the cleanup runs through the queue.
        if unit.link_id.is_none() && self.store.remove_unlinked_unit(id).await? {
            info!(unit_id = id, "upload cancelled before remote creation");
            self.events.emit(UploadEvent::Cancelled { unit_id: id });
            return Ok(CancelOutcome::Removed);
        }

        self.queue
            .enqueue(
                &WorkPayload::Upload { unit_id: id },
                Priority::User.rank(),
                unit.network,
            )
            .await?;
        Ok(CancelOutcome::Scheduled)
    }

    /// Put a failed unit back in the queue at the stage it failed in.
    pub async fn retry_unit(&self, id: i64) -> Result<UploadState, EngineError> {
        let unit = self
            .store
            .get_unit(id)
            .await?
            .ok_or(EngineError::UnitNotFound(id))?;
        let Some(stage) = self.store.reset_failed(id).await? else {
            return Err(EngineError::NotRetryable {
                id,
                state: unit.state,
            });
        };
        self.enqueue_unit(&unit).await?;
        info!(unit_id = id, stage = %stage, "retry requested");
        Ok(stage)
    }

    pub async fn register_folder(&self, folder: &BackupFolder) -> Result<(), EngineError> {
        if folder.local_path.is_empty() {
            return Err(PipelineError::Validation("backup folder needs a local path".into()).into());
        }
        self.store.upsert_backup_folder(folder).await?;
        info!(folder_id = %folder.id, path = %folder.local_path, "backup folder registered");
        Ok(())
    }

    pub async fn request_scan(&self, folder_id: &str) -> Result<EnqueueOutcome, EngineError> {
        if self.store.get_backup_folder(folder_id).await?.is_none() {
            return Err(EngineError::FolderNotFound(folder_id.to_string()));
        }
        Ok(self
            .queue
            .enqueue(
                &WorkPayload::ScanFolder {
                    folder_id: folder_id.to_string(),
                },
                Priority::Backup.rank(),
                NetworkPolicy::Any,
            )
            .await?)
    }

    pub fn set_network(&self, class: NetworkClass) {
        self.queue.set_network(class);
    }

    pub fn network(&self) -> NetworkClass {
        self.queue.network()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe_notifications()
    }
}

#[async_trait]
impl WorkHandler for Engine {
    async fn handle(&self, payload: WorkPayload, cancel: CancellationToken) -> Result<(), WorkError> {
        match payload {
            WorkPayload::Upload { unit_id } => {
                let outcome = self.pipeline.run(unit_id, &cancel).await?;
                tracing::debug!(unit_id, ?outcome, "upload run finished");
            }
            WorkPayload::MaterializeBulk { bulk_id } => {
                self.bulks.materialize(bulk_id).await?;
            }
            WorkPayload::ScanFolder { folder_id } => {
                let scanned = self
                    .scanner
                    .scan(&folder_id)
                    .await
                    .map_err(PipelineError::from)?;
                if let Some(bulk) = scanned
                    && !bulk.items.is_empty()
                {
                    self.bulks.submit(&bulk).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_terminal(&self, payload: &WorkPayload, error: &WorkError) {
        let unit_id = match payload {
            WorkPayload::Upload { unit_id } => *unit_id,
            WorkPayload::MaterializeBulk { bulk_id } => {
                error!(%bulk_id, "bulk materialization failed, dropping bulk: {error}");
                if let Err(err) = self.store.delete_bulk(*bulk_id).await {
                    error!(%bulk_id, "could not drop bulk: {err}");
                }
                return;
            }
            WorkPayload::ScanFolder { .. } => {
                error!(work_key = %payload.key(), "work failed: {error}");
                return;
            }
        };
        let (stage, message) = match error {
            WorkError::Upload(err) => (Some(err.stage), err.source.to_string()),
            WorkError::Pipeline(err) => (None, err.to_string()),
        };
        let stage = match stage {
            Some(stage) => stage,
            None => match self.store.get_unit(unit_id).await {
                Ok(Some(unit)) => unit.state,
                _ => UploadState::Unprocessed,
            },
        };

        match self.store.mark_failed(unit_id, stage, &message).await {
            Ok(true) => {
                error!(unit_id, stage = %stage, "upload failed: {message}");
                self.events.emit(UploadEvent::Failed {
                    unit_id,
                    stage,
                    message,
                });
            }
            Ok(false) => {}
            Err(err) => error!(unit_id, "could not record failure: {err}"),
        }
    }
}
