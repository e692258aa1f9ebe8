//! Defines routes for the upload control surface.
//!
//! ## Structure
//! - **Bulks**
//!   - `POST   /bulks`: submit an ordered batch of local files
//!   - `GET    /bulks/{id}`: items not yet materialized
//!
//! - **Uploads**
//!   - `GET    /uploads?user=`: list units of a user
//!   - `GET    /uploads/{id}`: unit with progress and queue status
//!   - `POST   /uploads/{id}/cancel`: cancel and roll back
//!   - `POST   /uploads/{id}/retry`: resume a failed unit
//!
//! - **Backup folders**
//!   - `PUT    /folders/{id}`: register a folder
//!   - `POST   /folders/{id}/scan`: schedule a scan
//!
//! - `GET|PUT /network`, `GET /events`, `GET /notifications`
//! - `GET /healthz`, `GET /readyz`

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    upload_handlers::{
        cancel_upload, events, get_bulk, get_network, get_upload, list_uploads, notifications,
        put_folder, retry_upload, scan_folder, set_network, submit_bulk,
    },
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router; handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/bulks", post(submit_bulk))
        .route("/bulks/{id}", get(get_bulk))
        .route("/uploads", get(list_uploads))
        .route("/uploads/{id}", get(get_upload))
        .route("/uploads/{id}/cancel", post(cancel_upload))
        .route("/uploads/{id}/retry", post(retry_upload))
        .route("/folders/{id}", put(put_folder))
        .route("/folders/{id}/scan", post(scan_folder))
        .route("/network", get(get_network).put(set_network))
        .route("/events", get(events))
        .route("/notifications", get(notifications))
}
