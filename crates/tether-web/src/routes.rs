//! Operational routes.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{Metrics, WebError};

/// Per-agent status as reported by the orchestrator's registry.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent: String,
    pub org: String,
    pub connection: String,
    pub last_event_id: Option<i64>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Read-only view into the orchestrator's registry.
pub trait StatusSource: Send + Sync {
    fn agent_statuses(&self) -> Vec<AgentStatus>;
    /// (active sessions, active sub-agents)
    fn session_counts(&self) -> (usize, usize);
}

/// Shared state for the operational endpoints.
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub source: Arc<dyn StatusSource>,
    pub started_at: Instant,
}

/// Create the operational router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let agents = state.source.agent_statuses();
    let (sessions, sub_agents) = state.source.session_counts();

    Json(json!({
        "agents": agents,
        "active_sessions": sessions,
        "active_sub_agents": sub_agents,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, WebError> {
    Ok(state.metrics.render()?)
}
