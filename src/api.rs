//! HTTP API for the station recorder.
//!
//! The station front-end drives recording sessions and uploads through this
//! surface. Expected degraded outcomes (no camera, video-less session, a
//! skipped clip) are reported as 200 responses with flags so the front-end
//! can carry on; 5xx is reserved for genuinely broken requests.

use crate::camera::{CameraSelector, CameraStatus};
use crate::config::ApiConfig;
use crate::session::{ClipOutcome, SessionRegistry, SessionSnapshot, StartOutcome, StopOutcome};
use crate::uploader::{UploadBatch, UploadPipeline};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub selector: Arc<CameraSelector>,
    pub pipeline: Arc<UploadPipeline>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

fn not_found(what: &str, id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{what} '{id}' not found"),
            code: "NOT_FOUND".to_string(),
        }),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "station-recorder",
        "active_sessions": state.registry.active_count().await,
    }))
}

async fn camera_status(State(state): State<AppState>) -> Json<CameraStatus> {
    Json(state.selector.status().await)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    session_id: String,
    serial_number: String,
    station_id: String,
}

async fn start_recording(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Json<StartOutcome> {
    info!(session_id = %req.session_id, serial = %req.serial_number, "Start recording requested");
    Json(
        state
            .registry
            .start(&req.session_id, &req.serial_number, &req.station_id)
            .await,
    )
}

async fn get_recording(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.registry.get_active(&session_id).await {
        Some(snapshot) => Json::<SessionSnapshot>(snapshot).into_response(),
        None => not_found("session", &session_id),
    }
}

#[derive(Debug, Deserialize)]
struct PageRequest {
    page: u32,
}

async fn page_entry(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<PageRequest>,
) -> StatusCode {
    state.registry.mark_page_entry(&session_id, req.page).await;
    StatusCode::NO_CONTENT
}

async fn page_clip(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<PageRequest>,
) -> Json<ClipOutcome> {
    Json(state.registry.save_page_clip(&session_id, req.page).await)
}

async fn stop_recording(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.registry.stop(&session_id).await {
        Some(outcome) => Json::<StopOutcome>(outcome).into_response(),
        None => not_found("session", &session_id),
    }
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    batch_id: Option<String>,
    cleanup: Option<bool>,
}

#[derive(Debug, Serialize)]
struct UploadStarted {
    batch_id: String,
    accepted: bool,
}

/// Kick off an upload batch in the background and return its id for
/// progress polling.
async fn start_upload(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> (StatusCode, Json<UploadStarted>) {
    let batch_id = req
        .batch_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let cleanup = req.cleanup.unwrap_or(true);

    let pipeline = state.pipeline.clone();
    let id = batch_id.clone();
    tokio::spawn(async move {
        let batch = pipeline.upload_all(&id, cleanup).await;
        if !batch.success() {
            error!(batch_id = %id, failed = batch.failed, "Upload batch had failures");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(UploadStarted {
            batch_id,
            accepted: true,
        }),
    )
}

async fn upload_progress(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Response {
    match state.pipeline.get_progress(&batch_id) {
        Some(batch) => Json::<UploadBatch>(batch).into_response(),
        None => not_found("upload batch", &batch_id),
    }
}

/// Build the API router with all routes and middleware.
pub fn create_router(state: AppState, cfg: &ApiConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/v1/camera/status", get(camera_status))
        .route("/api/v1/recordings", post(start_recording))
        .route("/api/v1/recordings/:session_id", get(get_recording))
        .route("/api/v1/recordings/:session_id/page-entry", post(page_entry))
        .route("/api/v1/recordings/:session_id/page-clip", post(page_clip))
        .route("/api/v1/recordings/:session_id/stop", post(stop_recording))
        .route("/api/v1/uploads", post(start_upload))
        .route("/api/v1/uploads/:batch_id", get(upload_progress));

    if cfg.cors_enabled {
        let cors = if cfg.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<axum::http::HeaderValue> = cfg
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        };
        router = router.layer(cors);
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the API until the process shuts down.
pub async fn start_api_server(state: AppState, cfg: &ApiConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "API server listening");
    axum::serve(listener, create_router(state, cfg)).await?;
    Ok(())
}
