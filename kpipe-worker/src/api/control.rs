//! Administrative endpoints

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: String,
    pub removed: u64,
}

/// POST /retry
///
/// **Request:** `{"filename": "song.mp3"}`
///
/// **Errors:**
/// - 400 Bad Request: no filename
/// - 404 Not Found: file never entered the pipeline
pub async fn retry_file(
    State(state): State<AppState>,
    Json(payload): Json<RetryRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let filename = payload
        .filename
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No filename provided".to_string()))?;

    state.admin.retry(&filename).await?;
    info!(file = %filename, "Retry requested over HTTP");

    Ok(Json(MessageResponse {
        message: "ok".to_string(),
    }))
}

/// POST /reset
///
/// Drops every file record. Refused unless `server.allow_reset` is set.
pub async fn reset_pipeline(State(state): State<AppState>) -> ApiResult<Json<ResetResponse>> {
    if !state.allow_reset {
        return Err(ApiError::Forbidden(
            "Reset is disabled; set server.allow_reset to enable it".to_string(),
        ));
    }

    let removed = state.admin.purge_all().await?;
    Ok(Json(ResetResponse {
        status: "reset complete".to_string(),
        removed,
    }))
}

pub fn control_routes() -> Router<AppState> {
    Router::new()
        .route("/retry", post(retry_file))
        .route("/reset", post(reset_pipeline))
}
