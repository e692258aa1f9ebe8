//! Bulk ingestion: persist an ordered batch now, turn it into upload units
//! in the background.

use crate::models::{
    bulk::{NewBulk, UploadBulk},
    upload_unit::{NetworkPolicy, NewUploadUnit, Priority},
    work::WorkPayload,
};
use crate::services::{
    failure::PipelineError,
    upload_store::{UnitAdmission, UploadStore},
    work_queue::WorkQueue,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct BulkService {
    store: UploadStore,
    queue: Arc<WorkQueue>,
}

impl BulkService {
    pub fn new(store: UploadStore, queue: Arc<WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Persist `bulk` and schedule its materialization. Does not touch the
    /// network or the sources.
    pub async fn submit(&self, bulk: &NewBulk) -> Result<Uuid, PipelineError> {
        if bulk.items.iter().any(|item| item.source_uri.is_empty()) {
            return Err(PipelineError::Validation(
                "bulk items need a source uri".into(),
            ));
        }
        let id = self.store.insert_bulk(bulk).await?;
        self.queue
            .enqueue(
                &WorkPayload::MaterializeBulk { bulk_id: id },
                bulk.priority.rank(),
                // Materializing only writes rows, so it never waits for the network.
                NetworkPolicy::Any,
            )
            .await?;
        info!(bulk_id = %id, items = bulk.items.len(), "bulk submitted");
        Ok(id)
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<UploadBulk>, PipelineError> {
        Ok(self.store.load_bulk(id).await?)
    }

    /// Turn the remaining items of a bulk into upload units in submission
    /// order and schedule each one. Backup bulks stop at the backlog limit
    /// and pick up where they left off once it drains.
    pub async fn materialize(&self, bulk_id: Uuid) -> Result<usize, PipelineError> {
        let Some(bulk) = self.store.load_bulk(bulk_id).await? else {
            debug!(%bulk_id, "bulk already consumed");
            return Ok(0);
        };
        let header = bulk.header;
        let mut created = 0;

        while let Some(item) = self.store.next_bulk_item(bulk_id).await? {
            if header.priority == Priority::Backup {
                self.queue.admit_backup().await?;
            }
            let unit = NewUploadUnit {
                user_id: header.user_id.clone(),
                volume_id: header.volume_id.clone(),
                parent_id: header.parent_id.clone(),
                source_uri: item.source_uri.clone(),
                name: item.name.clone(),
                size_bytes: item.size_bytes,
                mime_type: item.mime_type.clone(),
                priority: header.priority,
                network: header.network,
                delete_source: header.delete_source,
                cache_policy: header.cache_policy,
                bulk_id: Some(bulk_id),
            };
            let admission = self.store.materialize_item(&item, &unit).await?;
            if let UnitAdmission::Attached(existing) = admission {
                debug!(%bulk_id, unit_id = existing, "source already queued");
            } else {
                created += 1;
            }
            self.queue
                .enqueue(
                    &WorkPayload::Upload {
                        unit_id: admission.unit_id(),
                    },
                    header.priority.rank(),
                    header.network,
                )
                .await?;
        }

        self.store.delete_bulk(bulk_id).await?;
        info!(%bulk_id, created, "bulk materialized");
        Ok(created)
    }
}
