//! Error types for the platform client and stream listener.

use thiserror::Error;

/// Errors that can occur when talking to the collaboration platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Credential rejected by the platform (invalid or revoked).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed before a response was produced.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rate limited.
    #[error("rate limited{}", retry_after_secs.map(|s| format!(" (retry after {}s)", s)).unwrap_or_default())]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Non-success response from the platform API.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Event stream failure (read error, watchdog timeout, stream end).
    #[error("stream error: {0}")]
    Stream(String),
}

impl PlatformError {
    /// Whether this failure means the credential is invalid or revoked.
    ///
    /// Auth failures stop the owning agent permanently; they are never
    /// retried.
    pub fn is_auth(&self) -> bool {
        match self {
            PlatformError::Auth(_) => true,
            PlatformError::Api { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }

    /// Whether a retry with backoff is worthwhile.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlatformError::Http(_) | PlatformError::Stream(_) => true,
            PlatformError::RateLimited { .. } => true,
            PlatformError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
