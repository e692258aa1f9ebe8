//! src/services/work_queue.rs
//!
//! WorkQueue: durable, keyed, priority-ordered dispatcher.
//!
//! Items live in `work_items`; `work_key` is unique, so a key has at most one
//! pending or running item. A single dispatcher claims the best eligible item
//! (priority, then age) whose network requirement the current connectivity
//! satisfies and hands it to a bounded pool of workers. The queue is the only
//! place that turns a failure into retry, hold or terminal.

use crate::models::{
    upload_unit::NetworkPolicy,
    work::{ExistingWorkPolicy, WorkItem, WorkPayload, WorkState},
};
use crate::services::{
    events::{EventBus, UploadEvent},
    failure::{PipelineError, WorkError},
    retry::RetryPolicy,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{Notify, Semaphore, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connectivity currently available to the device.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Offline,
    Metered,
    Unmetered,
}

impl NetworkClass {
    pub fn allows(self, policy: NetworkPolicy) -> bool {
        match self {
            Self::Offline => false,
            Self::Metered => policy == NetworkPolicy::Any,
            Self::Unmetered => true,
        }
    }
}

impl FromStr for NetworkClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "offline" => Ok(Self::Offline),
            "metered" => Ok(Self::Metered),
            "unmetered" => Ok(Self::Unmetered),
            other => Err(format!("unknown network class `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue store: {0}")]
    Store(#[from] sqlx::Error),
    #[error("invalid work payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("upload limit reached: {pending} uploads pending")]
    LimitReached { pending: i64 },
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Store(err) => Self::Store(err),
            QueueError::Payload(err) => Self::Payload(err),
            QueueError::LimitReached { .. } => Self::LimitReached,
        }
    }
}

/// What happened to an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued,
    /// The key was already queued and the existing item stays.
    Kept,
    /// The pending item under the key now carries the new request.
    Replaced,
    /// The running item was interrupted and will run again with the new request.
    Rerun,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Work items processed concurrently.
    pub workers: usize,
    /// Pending uploads at which backup work stops being admitted.
    pub backlog_threshold: i64,
    /// Upper bound on how long the dispatcher sleeps between checks.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            backlog_threshold: 500,
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::uploads(),
        }
    }
}

/// Executes claimed work.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn handle(&self, payload: WorkPayload, cancel: CancellationToken) -> Result<(), WorkError>;

    /// Called once when `payload` failed for good.
    async fn on_terminal(&self, payload: &WorkPayload, error: &WorkError);
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

const ITEM_COLUMNS: &str =
    "id, work_key, payload, priority, network, state, attempts, rerun, not_before, last_error, created_at";

pub struct WorkQueue {
    db: Arc<SqlitePool>,
    settings: QueueSettings,
    events: EventBus,
    network: watch::Sender<NetworkClass>,
    wakeup: Notify,
    running: DashMap<String, CancellationToken>,
    limit_reached: AtomicBool,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(
        db: Arc<SqlitePool>,
        settings: QueueSettings,
        events: EventBus,
        network: NetworkClass,
    ) -> Self {
        let (network, _) = watch::channel(network);
        Self {
            db,
            settings,
            events,
            network,
            wakeup: Notify::new(),
            running: DashMap::new(),
            limit_reached: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn network(&self) -> NetworkClass {
        *self.network.borrow()
    }

    /// Record a connectivity change; held work resumes on its own.
    pub fn set_network(&self, class: NetworkClass) {
        let previous = self.network.send_replace(class);
        if previous != class {
            info!(from = ?previous, to = ?class, "network class changed");
        }
        self.wakeup.notify_one();
    }

    /// Enqueue `payload` under its key, honouring the payload's policy for
    /// an existing item.
    pub async fn enqueue(
        &self,
        payload: &WorkPayload,
        priority: i64,
        network: NetworkPolicy,
    ) -> Result<EnqueueOutcome, QueueError> {
        let key = payload.key();
        let body = serde_json::to_string(payload)?;
        let local = !payload.needs_network();
        let now = now_millis();

        let outcome = match payload.existing_policy() {
            ExistingWorkPolicy::Keep => {
                let inserted = sqlx::query(
                    "INSERT INTO work_items
                        (work_key, payload, priority, network, local, state, attempts, rerun,
                         not_before, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
                     ON CONFLICT(work_key) DO NOTHING",
                )
                .bind(&key)
                .bind(&body)
                .bind(priority)
                .bind(network)
                .bind(local)
                .bind(WorkState::Pending)
                .bind(now)
                .bind(Utc::now())
                .execute(&*self.db)
                .await?;
                if inserted.rows_affected() == 1 {
                    EnqueueOutcome::Enqueued
                } else {
                    EnqueueOutcome::Kept
                }
            }
            ExistingWorkPolicy::AppendOrReplace => {
                let previous = sqlx::query_scalar::<_, WorkState>(
                    "SELECT state FROM work_items WHERE work_key = ?",
                )
                .bind(&key)
                .fetch_optional(&*self.db)
                .await?;
                sqlx::query(
                    "INSERT INTO work_items
                        (work_key, payload, priority, network, local, state, attempts, rerun,
                         not_before, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
                     ON CONFLICT(work_key) DO UPDATE SET
                        payload = excluded.payload,
                        priority = excluded.priority,
                        network = excluded.network,
                        attempts = 0,
                        last_error = NULL,
                        not_before = excluded.not_before,
                        rerun = CASE WHEN work_items.state = 'running' THEN 1 ELSE 0 END",
                )
                .bind(&key)
                .bind(&body)
                .bind(priority)
                .bind(network)
                .bind(local)
                .bind(WorkState::Pending)
                .bind(now)
                .bind(Utc::now())
                .execute(&*self.db)
                .await?;

                match previous {
                    None => EnqueueOutcome::Enqueued,
                    Some(WorkState::Pending) => EnqueueOutcome::Replaced,
                    Some(WorkState::Running) => {
                        if let Some(token) = self.running.get(&key) {
                            token.cancel();
                        }
                        EnqueueOutcome::Rerun
                    }
                }
            }
        };

        debug!(work_key = %key, ?outcome, "enqueue");
        self.wakeup.notify_one();
        Ok(outcome)
    }

    /// Drop pending work under `key` and interrupt running work.
    pub async fn cancel(&self, key: &str) -> Result<bool, QueueError> {
        let interrupted = match self.running.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        let removed = sqlx::query("DELETE FROM work_items WHERE work_key = ? AND state = ?")
            .bind(key)
            .bind(WorkState::Pending)
            .execute(&*self.db)
            .await?;
        Ok(interrupted || removed.rows_affected() > 0)
    }

    pub async fn status(&self, key: &str) -> Result<Option<WorkItem>, QueueError> {
        Ok(sqlx::query_as::<_, WorkItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE work_key = ?"
        ))
        .bind(key)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Pending or running uploads.
    pub async fn pending_uploads(&self) -> Result<i64, QueueError> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM work_items WHERE work_key LIKE 'upload:%'",
        )
        .fetch_one(&*self.db)
        .await?)
    }

    /// Admission check for backup-initiated work. Refuses while the upload
    /// backlog is at the threshold; "limit reached" is broadcast once per
    /// episode and "limit cleared" once it drains.
    pub async fn admit_backup(&self) -> Result<(), QueueError> {
        let pending = self.pending_uploads().await?;
        if pending >= self.settings.backlog_threshold {
            if !self.limit_reached.swap(true, Ordering::SeqCst) {
                warn!(pending, "upload limit reached");
                self.events.emit(UploadEvent::LimitReached { pending });
            }
            return Err(QueueError::LimitReached { pending });
        }
        Ok(())
    }

    async fn check_backlog_drained(&self) {
        if !self.limit_reached.load(Ordering::SeqCst) {
            return;
        }
        match self.pending_uploads().await {
            Ok(pending) if pending < self.settings.backlog_threshold => {
                if self.limit_reached.swap(false, Ordering::SeqCst) {
                    info!(pending, "upload backlog drained");
                    self.events.emit(UploadEvent::LimitCleared { pending });
                }
            }
            Ok(_) => {}
            Err(err) => warn!("backlog check failed: {err}"),
        }
    }

    /// Return items orphaned by a previous process to the pending set.
    pub async fn recover(&self) -> Result<u64, QueueError> {
        let result = sqlx::query("UPDATE work_items SET state = ?, rerun = 0 WHERE state = ?")
            .bind(WorkState::Pending)
            .bind(WorkState::Running)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() > 0 {
            info!(count = result.rows_affected(), "recovered interrupted work");
        }
        Ok(result.rows_affected())
    }

    /// Claim the best eligible item for the current network class.
    pub async fn claim_next(&self) -> Result<Option<WorkItem>, QueueError> {
        let class = self.network();
        loop {
            // Local work ignores connectivity; everything else must be
            // allowed on the current network.
            let candidate = sqlx::query_as::<_, WorkItem>(&format!(
                "SELECT {ITEM_COLUMNS} FROM work_items
                 WHERE state = ? AND not_before <= ?
                   AND (local = 1 OR (network = ? AND ?) OR (network = ? AND ?))
                 ORDER BY priority ASC, id ASC LIMIT 1"
            ))
            .bind(WorkState::Pending)
            .bind(now_millis())
            .bind(NetworkPolicy::Any)
            .bind(class.allows(NetworkPolicy::Any))
            .bind(NetworkPolicy::UnmeteredOnly)
            .bind(class.allows(NetworkPolicy::UnmeteredOnly))
            .fetch_optional(&*self.db)
            .await?;
            let Some(mut item) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query("UPDATE work_items SET state = ? WHERE id = ? AND state = ?")
                .bind(WorkState::Running)
                .bind(item.id)
                .bind(WorkState::Pending)
                .execute(&*self.db)
                .await?;
            if claimed.rows_affected() == 1 {
                item.state = WorkState::Running;
                return Ok(Some(item));
            }
        }
    }

    /// Milliseconds until the earliest delayed item becomes eligible.
    async fn next_due_in(&self) -> Option<Duration> {
        let earliest = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(not_before) FROM work_items WHERE state = ?",
        )
        .bind(WorkState::Pending)
        .fetch_one(&*self.db)
        .await
        .ok()
        .flatten()?;
        Some(Duration::from_millis(
            (earliest - now_millis()).max(0) as u64,
        ))
    }

    /// Settle a finished item according to its result.
    pub async fn finish(
        &self,
        item: &WorkItem,
        result: Result<(), WorkError>,
        handler: &dyn WorkHandler,
    ) -> Result<(), QueueError> {
        let rerun = sqlx::query_scalar::<_, bool>("SELECT rerun FROM work_items WHERE id = ?")
            .bind(item.id)
            .fetch_optional(&*self.db)
            .await?
            .unwrap_or(false);

        if rerun {
            debug!(work_key = %item.work_key, "re-running with replacement request");
            self.reschedule(item.id, 0, Duration::ZERO, None).await?;
            return Ok(());
        }

        let err = match result {
            Ok(()) => {
                sqlx::query("DELETE FROM work_items WHERE id = ?")
                    .bind(item.id)
                    .execute(&*self.db)
                    .await?;
                return Ok(());
            }
            Err(err) => err,
        };

        let class = err.class();
        let message = err.to_string();
        let attempt = item.attempts as u32 + 1;
        if class.is_retryable() && !class.counts_against_budget() {
            let delay = err.retry_after().unwrap_or(self.settings.retry.hold_delay);
            debug!(work_key = %item.work_key, ?delay, "holding: {message}");
            self.reschedule(item.id, item.attempts, delay, Some(&message))
                .await?;
        } else if class.is_retryable() && !self.settings.retry.exhausted(attempt) {
            let backoff = self.settings.retry.delay_for(attempt);
            let delay = err.retry_after().map_or(backoff, |hint| hint.max(backoff));
            warn!(
                work_key = %item.work_key,
                attempt,
                ?delay,
                "retryable failure: {message}"
            );
            self.events.emit(UploadEvent::Retrying {
                unit_id: err.unit_id(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            self.reschedule(item.id, i64::from(attempt), delay, Some(&message))
                .await?;
        } else {
            error!(work_key = %item.work_key, ?class, "terminal failure: {message}");
            sqlx::query("DELETE FROM work_items WHERE id = ?")
                .bind(item.id)
                .execute(&*self.db)
                .await?;
            match item.payload() {
                Ok(payload) => handler.on_terminal(&payload, &err).await,
                Err(decode) => warn!(work_key = %item.work_key, "undecodable payload: {decode}"),
            }
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: i64,
        attempts: i64,
        delay: Duration,
        last_error: Option<&str>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE work_items
             SET state = ?, attempts = ?, rerun = 0, not_before = ?, last_error = ?
             WHERE id = ?",
        )
        .bind(WorkState::Pending)
        .bind(attempts)
        .bind(now_millis() + delay.as_millis() as i64)
        .bind(last_error)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Run one claimed item to completion.
    async fn execute(&self, item: WorkItem, handler: &dyn WorkHandler) {
        let token = self.shutdown.child_token();
        self.running.insert(item.work_key.clone(), token.clone());

        let result = match item.payload() {
            Ok(payload) => {
                debug!(work_key = %item.work_key, "dispatching");
                handler.handle(payload, token).await
            }
            Err(err) => Err(WorkError::Pipeline(err.into())),
        };
        self.running.remove(&item.work_key);

        if let Err(err) = self.finish(&item, result, handler).await {
            error!(work_key = %item.work_key, "failed to settle work item: {err}");
        }
        self.check_backlog_drained().await;
        self.wakeup.notify_one();
    }

    /// Start the dispatcher. Workers stop picking up new items once
    /// [`WorkQueue::shutdown`] is called.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn WorkHandler>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.dispatch(handler).await })
    }

    async fn dispatch(self: Arc<Self>, handler: Arc<dyn WorkHandler>) {
        let permits = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut network = self.network.subscribe();
        info!(workers = self.settings.workers, "work queue started");

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next().await {
                Ok(Some(item)) => {
                    let queue = self.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        queue.execute(item, handler.as_ref()).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    drop(permit);
                    warn!("claiming work failed: {err}");
                }
            }

            let idle = self
                .next_due_in()
                .await
                .map_or(self.settings.poll_interval, |due| {
                    due.min(self.settings.poll_interval)
                })
                .max(Duration::from_millis(1));
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = network.changed() => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }
        // Interrupted items settle before the dispatcher returns.
        let _ = permits
            .acquire_many(self.settings.workers.max(1) as u32)
            .await;
        info!("work queue stopped");
    }

    /// Stop dispatching and interrupt running work cooperatively.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
