//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use leech_core::{CoreError, RuntimeError};

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Invalid history document.
    #[error("invalid history: {0}")]
    History(#[from] CoreError),

    /// The engine task is gone.
    #[error("engine unavailable: {0}")]
    Engine(#[from] RuntimeError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::History(_) => (StatusCode::BAD_REQUEST, "invalid_history"),
            ApiError::Engine(_) => (StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status.is_server_error() {
            tracing::warn!(code, error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
