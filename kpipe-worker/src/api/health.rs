//! Liveness, per-status counts and plain-text metrics

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::{ApiResult, AppState};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since the server started
    pub uptime_seconds: u64,
}

fn uptime_seconds(state: &AppState) -> u64 {
    Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds()
        .max(0) as u64
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "kpipe-worker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime_seconds(&state),
    })
}

/// GET /pipeline-health
///
/// Number of files in each status; every status is listed.
pub async fn pipeline_health(State(state): State<AppState>) -> ApiResult<Json<BTreeMap<String, u64>>> {
    Ok(Json(state.store.count_by_status().await?))
}

/// GET /metrics
///
/// Prometheus-style text: one `karaoke_files_<status>` gauge per status
/// followed by the server uptime.
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let counts = state.store.count_by_status().await?;

    let mut lines: Vec<String> = kpipe_common::FileStatus::ALL
        .iter()
        .map(|status| {
            let count = counts.get(status.as_str()).copied().unwrap_or(0);
            format!("karaoke_files_{} {}", status, count)
        })
        .collect();
    lines.push(format!("karaoke_uptime_seconds {}", uptime_seconds(&state)));

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], lines.join("\n") + "\n"))
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/pipeline-health", get(pipeline_health))
        .route("/metrics", get(metrics))
}
