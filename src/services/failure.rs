//! Failure taxonomy shared by every pipeline component.
//!
//! Component errors are wrapped into [`PipelineError`], tagged with the unit
//! and stage in [`UploadError`], and classified exactly once by the work
//! queue through [`ErrorClass`].

use crate::models::upload_unit::UploadState;
use crate::services::{
    block_splitter::BlockError, cache_mover::MoveError, crypto::CryptoError,
    digest_service::DigestError, folder_scanner::ScanError, remote::RemoteError,
};
use std::time::Duration;
use thiserror::Error;

/// How the queue reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network timeout, 5xx, rate limiting: retried with backoff against the budget.
    Transient,
    /// A condition that is not met yet (key material, backlog): held without
    /// spending the retry budget.
    Conditional,
    /// Source vanished, permission revoked, validation failure.
    TerminalLocal,
    /// Quota exceeded, remote object gone.
    TerminalRemote,
    /// Conflicting remote state that survived reconciliation.
    Conflict,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Conditional)
    }

    pub fn counts_against_budget(self) -> bool {
        matches!(self, Self::Transient)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("metadata store: {0}")]
    Store(#[from] sqlx::Error),
    #[error("moving artifacts failed: {0}")]
    Move(#[from] MoveError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("upload limit reached")]
    LimitReached,
    #[error("revision incomplete: {0}")]
    IncompleteRevision(String),
    #[error("invalid work payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("validation failed: {0}")]
    Validation(String),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Digest(err) => err.class(),
            Self::Crypto(err) => err.class(),
            Self::Block(err) => err.class(),
            Self::Remote(err) => err.class(),
            Self::Move(err) => err.class(),
            Self::Scan(err) => err.class(),
            Self::Store(_) => ErrorClass::Transient,
            Self::LimitReached => ErrorClass::Conditional,
            Self::IncompleteRevision(_) | Self::Payload(_) | Self::Validation(_) => {
                ErrorClass::TerminalLocal
            }
        }
    }

    /// Delay requested by the failure itself (e.g. a rate-limit hint).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Remote(RemoteError::RateLimited {
                retry_after_secs: Some(secs),
            }) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// A pipeline failure annotated with the unit and the stage it happened in.
#[derive(Debug, Error)]
#[error("unit {unit_id} failed while {stage}: {source}")]
pub struct UploadError {
    pub unit_id: i64,
    pub stage: UploadState,
    #[source]
    pub source: PipelineError,
}

impl UploadError {
    pub fn new(unit_id: i64, stage: UploadState, source: impl Into<PipelineError>) -> Self {
        Self {
            unit_id,
            stage,
            source: source.into(),
        }
    }
}

/// Error returned by a work handler to the queue.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl WorkError {
    pub fn class(&self) -> ErrorClass {
        self.pipeline().class()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.pipeline().retry_after()
    }

    pub fn unit_id(&self) -> Option<i64> {
        match self {
            Self::Upload(err) => Some(err.unit_id),
            Self::Pipeline(_) => None,
        }
    }

    fn pipeline(&self) -> &PipelineError {
        match self {
            Self::Upload(err) => &err.source,
            Self::Pipeline(err) => err,
        }
    }
}
