//! Read-only views of file records

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use kpipe_common::{FileError, FileRecord, FileStatus};
use serde::Serialize;

use crate::{ApiError, ApiResult, AppState};

/// JSON array plus `Content-Range: items <first>-<last>/<total>`
fn listing(records: Vec<FileRecord>) -> Response {
    let total = records.len();
    let range = if total == 0 {
        "items */0".to_string()
    } else {
        format!("items 0-{}/{}", total - 1, total)
    };

    let mut response = Json(records).into_response();
    if let Ok(value) = HeaderValue::from_str(&range) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

/// GET /status
pub async fn list_status(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(listing(state.store.list_all().await?))
}

/// GET /status/:filename
pub async fn file_status(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Json<FileRecord>> {
    state
        .store
        .get(&filename)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("File {} not found in pipeline", filename)))
}

/// GET /error-files
pub async fn error_files(State(state): State<AppState>) -> ApiResult<Response> {
    let mut records = Vec::new();
    for filename in state.store.list_by_status(FileStatus::Error).await? {
        if let Some(record) = state.store.get(&filename).await? {
            records.push(record);
        }
    }
    Ok(listing(records))
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub filename: String,
    pub error: FileError,
}

/// GET /error-details/:filename
pub async fn error_details(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Json<ErrorDetails>> {
    let error = state
        .store
        .get(&filename)
        .await?
        .and_then(|record| record.last_error)
        .ok_or_else(|| ApiError::NotFound(format!("No error recorded for {}", filename)))?;

    Ok(Json(ErrorDetails { filename, error }))
}

pub fn status_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(list_status))
        .route("/status/:filename", get(file_status))
        .route("/error-files", get(error_files))
        .route("/error-details/:filename", get(error_details))
}
