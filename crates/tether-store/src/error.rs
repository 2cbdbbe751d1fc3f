//! Error types for the local state store.

use thiserror::Error;

/// Errors that can occur in local state operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be interpreted.
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}
