//! Broadcast of pipeline events and the user-visible notifications derived
//! from them.

use crate::models::upload_unit::UploadState;
use dashmap::DashSet;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// A unit left `Unprocessed` and is being prepared for transfer.
    Preparing { unit_id: i64 },
    StageChanged {
        unit_id: i64,
        state: UploadState,
    },
    Progress {
        unit_id: i64,
        bytes_confirmed: i64,
        size_bytes: i64,
    },
    Retrying {
        unit_id: Option<i64>,
        attempt: u32,
        delay_ms: u64,
    },
    LimitReached { pending: i64 },
    LimitCleared { pending: i64 },
    Completed { unit_id: i64, attached: bool },
    Failed {
        unit_id: i64,
        stage: UploadState,
        message: String,
    },
    Cancelled { unit_id: i64 },
}

/// What the user gets to see.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    PreparingUpload { unit_id: i64 },
    UploadLimitReached,
    UploadFailed { unit_id: i64, message: String },
}

/// Map an event to its notification; most events produce none.
pub fn notification_for(event: &UploadEvent) -> Option<Notification> {
    match event {
        UploadEvent::Preparing { unit_id } => Some(Notification::PreparingUpload {
            unit_id: *unit_id,
        }),
        UploadEvent::LimitReached { .. } => Some(Notification::UploadLimitReached),
        UploadEvent::Failed {
            unit_id, message, ..
        } => Some(Notification::UploadFailed {
            unit_id: *unit_id,
            message: message.clone(),
        }),
        _ => None,
    }
}

/// Cloneable handle to the event channels.
#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<UploadEvent>,
    notifications: broadcast::Sender<Notification>,
    reported_failures: Arc<DashSet<(i64, String)>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (notifications, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            events,
            notifications,
            reported_failures: Arc::new(DashSet::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Publish an event. Nobody listening is not an error.
    pub fn emit(&self, event: UploadEvent) {
        match &event {
            UploadEvent::Completed { unit_id, .. } | UploadEvent::Cancelled { unit_id } => {
                self.reported_failures.retain(|(id, _)| id != unit_id);
            }
            _ => {}
        }

        if let Some(notification) = notification_for(&event) {
            let fresh = match &notification {
                Notification::UploadFailed { unit_id, message } => {
                    self.reported_failures.insert((*unit_id, message.clone()))
                }
                _ => true,
            };
            if fresh {
                let _ = self.notifications.send(notification);
            }
        }
        let _ = self.events.send(event);
    }
}
