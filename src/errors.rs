use crate::services::{
    engine::EngineError,
    failure::{ErrorClass, PipelineError},
    work_queue::QueueError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

fn pipeline_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::LimitReached => StatusCode::TOO_MANY_REQUESTS,
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        _ if err.class() == ErrorClass::Conflict => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::UnitNotFound(_)
            | EngineError::BulkNotFound(_)
            | EngineError::FolderNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::NotRetryable { .. } => StatusCode::CONFLICT,
            EngineError::Pipeline(inner) => pipeline_status(inner),
            EngineError::Queue(QueueError::LimitReached { .. }) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Queue(_) | EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {err}");
        }
        AppError::new(status, err.to_string())
    }
}
