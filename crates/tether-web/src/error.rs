//! Error types for the operational endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors that can occur serving operational endpoints.
#[derive(Debug, Error)]
pub enum WebError {
    /// Metrics encoding failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
