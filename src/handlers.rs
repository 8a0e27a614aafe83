use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tower_http::services::ServeDir;
use tracing::{trace, warn};

use crate::capture::CaptureService;
use crate::config_store::{self, ConfigStore};
use crate::errors::StreamError;
use crate::mjpeg;
use crate::settings::StreamSettings;
use crate::stream_manager::{StreamManager, UpdateOutcome};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub capture: Arc<CaptureService>,
    pub config_store: Arc<dyn ConfigStore>,
    pub base_path: String,
    pub feed_wait: Duration,
}

impl AppState {
    // Public URL of a file under /images, with a cache-busting timestamp
    fn image_url(&self, path: &Path) -> String {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        format!("{}/images/{}?t={}", self.base_path, name, chrono::Utc::now().timestamp())
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

fn error_response(code: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiResponse::<()>::error(message, code))).into_response()
}

fn stream_error(err: &StreamError) -> Response {
    error_response(err.status_code(), &err.to_string())
}

fn ok(data: serde_json::Value) -> Response {
    Json(ApiResponse::success(data)).into_response()
}

/// All routes, mounted under `base_path`.
pub fn router(state: AppState, images_directory: &Path) -> Router {
    let base_path = state.base_path.clone();
    let routes = Router::new()
        .route("/api/capture_one", get(capture_one_handler))
        .route("/api/stream/start", get(stream_start_handler))
        .route("/api/stream/stop", get(stream_stop_handler))
        .route("/api/stream/update", get(stream_update_handler))
        .route("/api/stream/status", get(stream_status_handler))
        .route("/api/stream/feed.mjpeg", get(stream_feed_handler))
        .route("/api/live_start", get(live_start_handler))
        .route("/api/live_stop", get(live_stop_handler))
        .route("/api/live_frame", get(live_frame_handler))
        .route("/api/config_get", get(config_get_handler))
        .route("/api/config_set", post(config_set_handler))
        .nest_service("/images", ServeDir::new(images_directory))
        .with_state(state);

    if base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&base_path, routes)
    }
}

pub async fn capture_one_handler(
    State(state): State<AppState>,
    Query(settings): Query<StreamSettings>,
) -> Response {
    trace!("capture_one requested with {:?}", settings);
    match state.capture.capture_one(&settings).await {
        Ok(outcome) => ok(serde_json::json!({
            "url": state.image_url(&outcome.path),
            "message": outcome.message(),
            "source": outcome.source,
        })),
        Err(e) => stream_error(&e),
    }
}

pub async fn stream_start_handler(
    State(state): State<AppState>,
    Query(settings): Query<StreamSettings>,
) -> Response {
    trace!("stream start requested with {:?}", settings);
    match state.manager.start(settings).await {
        Ok(()) => ok(serde_json::json!({
            "message": "Stream started",
            "clients": state.manager.status().clients,
        })),
        Err(e) => stream_error(&e),
    }
}

pub async fn stream_stop_handler(State(state): State<AppState>) -> Response {
    let was_running = state.manager.stop().await;
    ok(serde_json::json!({
        "message": if was_running { "Stream stopped, camera handed back" } else { "Stream already stopped" },
    }))
}

pub async fn stream_update_handler(
    State(state): State<AppState>,
    Query(settings): Query<StreamSettings>,
) -> Response {
    trace!("stream update requested with {:?}", settings);
    if !state.manager.is_running() {
        return stream_error(&StreamError::NotRunning);
    }

    match state.manager.update_settings(&settings).await {
        Ok(UpdateOutcome::Restarted) => ok(serde_json::json!({
            "message": "Settings updated",
            "clients": state.manager.status().clients,
        })),
        Ok(UpdateOutcome::Pending) => ok(serde_json::json!({
            "message": "Settings updated, waiting for first frame",
            "clients": state.manager.status().clients,
        })),
        // stopped between the check and the update; settings kept for the next start
        Ok(UpdateOutcome::Stored) => stream_error(&StreamError::NotRunning),
        Err(e) => stream_error(&e),
    }
}

pub async fn stream_status_handler(State(state): State<AppState>) -> Response {
    Json(ApiResponse::success(state.manager.status())).into_response()
}

pub async fn stream_feed_handler(State(state): State<AppState>) -> Response {
    if !state.manager.wait_for_stream(state.feed_wait).await {
        return error_response(400, "Stream not running. Start it first.");
    }
    trace!("MJPEG client connected");
    mjpeg::response(state.manager.frames())
}

pub async fn live_start_handler(
    State(state): State<AppState>,
    Query(settings): Query<StreamSettings>,
) -> Response {
    match state.manager.start(settings.without_framerate()).await {
        Ok(()) => ok(serde_json::json!({ "message": "Live mode started (MJPEG stream)" })),
        Err(e) => stream_error(&e),
    }
}

pub async fn live_stop_handler(State(state): State<AppState>) -> Response {
    state.manager.stop().await;
    ok(serde_json::json!({ "message": "Live mode stopped" }))
}

pub async fn live_frame_handler(State(state): State<AppState>) -> Response {
    match state.capture.live_frame().await {
        Ok(outcome) => ok(serde_json::json!({
            "url": state.image_url(&outcome.path),
            "message": "Live",
        })),
        Err(StreamError::NotRunning) => error_response(400, "Stream not active"),
        Err(StreamError::NoFrame) => error_response(500, "No frame available"),
        Err(e) => stream_error(&e),
    }
}

pub async fn config_get_handler(State(state): State<AppState>) -> Response {
    match state.config_store.load().await {
        Ok(config) => Json(ApiResponse::success(config_store::tuning_view(&config))).into_response(),
        Err(e) => {
            warn!("Could not read allsky configuration: {}", e);
            stream_error(&e)
        }
    }
}

// The body is read as JSON whatever its content type
pub async fn config_set_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let updates = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Object(updates)) if !updates.is_empty() => updates,
        Ok(_) => return error_response(400, "No data"),
        Err(_) if body.iter().all(u8::is_ascii_whitespace) => return error_response(400, "No data"),
        Err(e) => return error_response(400, &format!("Invalid JSON: {}", e)),
    };
    trace!("config update requested for {:?}", updates.keys().collect::<Vec<_>>());

    let result = async {
        let mut config = state.config_store.load().await?;
        let changed = config_store::apply_updates(&mut config, &updates)?;
        if !changed.is_empty() {
            state.config_store.save(&config, &config_store::change_note(&changed)).await?;
        }
        Ok::<_, StreamError>(changed)
    }
    .await;

    match result {
        Ok(changed) => ok(serde_json::json!({ "message": "Config updated", "changed": changed })),
        Err(e) => {
            warn!("Config update failed: {}", e);
            stream_error(&e)
        }
    }
}
