//! HTTP handlers for the upload control surface.
//! Every handler is a thin shim over `Engine`; work itself happens in the
//! background queue, so mutating calls answer 202 once the request is durable.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{
        backup_folder::BackupFolder,
        bulk::{NewBulk, UploadBulk},
        upload_unit::{NetworkPolicy, UploadState, UploadUnit},
    },
    services::{
        engine::{CancelOutcome, UnitStatus},
        work_queue::{EnqueueOutcome, NetworkClass},
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListUploadsQuery {
    pub user: String,
}

#[derive(Debug, Serialize)]
pub struct BulkAccepted {
    pub bulk_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub unit_id: i64,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub unit_id: i64,
    /// Stage the unit resumes at.
    pub resumes_at: UploadState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkState {
    pub class: NetworkClass,
}

/// Body of `PUT /folders/{id}`.
#[derive(Debug, Deserialize)]
pub struct FolderRequest {
    pub user_id: String,
    pub volume_id: String,
    #[serde(default)]
    pub bucket_id: i64,
    pub local_path: String,
    pub remote_folder_id: String,
    #[serde(default = "unmetered_only")]
    pub network: NetworkPolicy,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn unmetered_only() -> NetworkPolicy {
    NetworkPolicy::UnmeteredOnly
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ScanAccepted {
    pub folder_id: String,
    pub outcome: EnqueueOutcome,
}

/// `POST /bulks`
pub async fn submit_bulk(
    State(state): State<AppState>,
    Json(bulk): Json<NewBulk>,
) -> Result<impl IntoResponse, AppError> {
    let bulk_id = state.engine.submit_bulk(&bulk).await?;
    Ok((StatusCode::ACCEPTED, Json(BulkAccepted { bulk_id })))
}

/// `GET /bulks/{id}`: items not yet turned into units, in submission order.
pub async fn get_bulk(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadBulk>, AppError> {
    Ok(Json(state.engine.bulk(id).await?))
}

/// `GET /uploads?user=`
pub async fn list_uploads(
    State(state): State<AppState>,
    Query(query): Query<ListUploadsQuery>,
) -> Result<Json<Vec<UploadUnit>>, AppError> {
    Ok(Json(state.engine.list_units(&query.user).await?))
}

/// `GET /uploads/{id}`
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<UnitStatus>, AppError> {
    Ok(Json(state.engine.unit_status(id).await?))
}

/// `POST /uploads/{id}/cancel`
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.engine.cancel_unit(id).await?;
    let status = match outcome {
        CancelOutcome::Scheduled => StatusCode::ACCEPTED,
        CancelOutcome::Removed | CancelOutcome::Ignored => StatusCode::OK,
    };
    Ok((
        status,
        Json(CancelResponse {
            unit_id: id,
            outcome,
        }),
    ))
}

/// `POST /uploads/{id}/retry`
pub async fn retry_upload(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let resumes_at = state.engine.retry_unit(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RetryResponse {
            unit_id: id,
            resumes_at,
        }),
    ))
}

/// `GET /network`
pub async fn get_network(State(state): State<AppState>) -> Json<NetworkState> {
    Json(NetworkState {
        class: state.engine.network(),
    })
}

/// `PUT /network`
pub async fn set_network(
    State(state): State<AppState>,
    Json(body): Json<NetworkState>,
) -> Json<NetworkState> {
    state.engine.set_network(body.class);
    tracing::info!(class = ?body.class, "network class changed");
    Json(body)
}

/// `PUT /folders/{id}`
pub async fn put_folder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FolderRequest>,
) -> Result<Json<BackupFolder>, AppError> {
    let folder = BackupFolder {
        id,
        user_id: body.user_id,
        volume_id: body.volume_id,
        bucket_id: body.bucket_id,
        local_path: body.local_path,
        remote_folder_id: body.remote_folder_id,
        network: body.network,
        enabled: body.enabled,
    };
    state.engine.register_folder(&folder).await?;
    Ok(Json(folder))
}

/// `POST /folders/{id}/scan`
pub async fn scan_folder(
    State(state): State<AppState>,
    Path(folder_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.engine.request_scan(&folder_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ScanAccepted { folder_id, outcome }),
    ))
}

/// Relay a broadcast channel as server-sent events named `name`. Slow
/// readers skip what they missed instead of stalling the pipeline.
fn relay<T>(
    rx: broadcast::Receiver<T>,
    name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Serialize + Clone + Send + 'static,
{
    let stream = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    let sse = Event::default()
                        .event(name)
                        .json_data(&item)
                        .unwrap_or_default();
                    return Some((Ok(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, stream = name, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /events`: every pipeline event.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    relay(state.engine.subscribe(), "upload")
}

/// `GET /notifications`: the user-facing subset, failures reported once.
pub async fn notifications(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    relay(state.engine.subscribe_notifications(), "notification")
}
