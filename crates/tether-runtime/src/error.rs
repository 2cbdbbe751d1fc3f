//! Error types for the bridge core.

use thiserror::Error;

/// Errors that can occur while relaying between platform and runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The agent runtime is unreachable; inbound events stay buffered
    /// and delivery is retried.
    #[error("agent runtime unavailable: {0}")]
    Unavailable(String),

    /// Relay attempted against a terminated sub-agent session.
    #[error("session terminated: {0}")]
    SessionTerminated(String),

    /// The runtime rejected the request outright.
    #[error("runtime rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Command execution failed inside the runtime.
    #[error("command failed: {0}")]
    Command(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Platform error.
    #[error("platform error: {0}")]
    Platform(#[from] tether_platform::PlatformError),

    /// Local state error.
    #[error("store error: {0}")]
    Store(#[from] tether_store::StoreError),

    /// Credential resolution error.
    #[error("secret error: {0}")]
    Secret(#[from] tether_platform::SecretError),
}

impl RuntimeError {
    /// Whether the runtime itself is down (as opposed to rejecting the
    /// request); unavailability is retried, rejection is not.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Unavailable(_) | RuntimeError::Timeout(_)
        )
    }
}
