//! Operational HTTP surface for the Tether bridge.
//!
//! Exposes per-agent connection state (`/status`), liveness
//! (`/health`), and Prometheus metrics (`/metrics`). Read-only; there
//! is no UI.

mod error;
mod metrics;
mod routes;

pub use error::WebError;
pub use metrics::Metrics;
pub use routes::{AgentStatus, AppState, StatusSource, create_router};
