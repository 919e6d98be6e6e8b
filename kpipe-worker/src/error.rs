//! Error types for kpipe-worker
//!
//! `StageError` is what a stage operation reports to the Retry Policy.
//! `ApiError` is what the status server reports to HTTP clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of one attempt of a stage operation
#[derive(Debug, Error)]
pub enum StageError {
    /// Worth another attempt (resource limits, flaky tool, not yet written input)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Input can never be processed; no further attempts are made
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Upstream artifact not present
    #[error("Missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Status Store or Stream Broker unavailable
    #[error("Store error: {0}")]
    Store(#[from] kpipe_common::Error),

    /// External program exited unsuccessfully
    #[error("{tool} exited with {status}: {stderr}")]
    External {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Every chunk pass failed
    #[error("Chunked processing failed after {attempts} passes: {last}")]
    Chunking {
        attempts: u32,
        #[source]
        last: Box<StageError>,
    },
}

impl StageError {
    /// Permanent failures skip the remaining retry budget
    pub fn is_permanent(&self) -> bool {
        matches!(self, StageError::Malformed(_))
    }
}

/// Result type for stage operations
pub type StageResult<T> = Result<T, StageError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Operation disabled by configuration (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// kpipe-common error
    #[error("Common error: {0}")]
    Common(#[from] kpipe_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(kpipe_common::Error::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg)
            }
            ApiError::Common(kpipe_common::Error::InvalidInput(msg)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
            }
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
