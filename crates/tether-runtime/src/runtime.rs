//! The agent-runtime collaborator contract.
//!
//! The runtime that actually executes prompts and commands is owned
//! externally; the bridge only requires this interface to exist. The
//! HTTP implementation targets the runtime's local session API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_platform::ChannelRef;

use crate::RuntimeError;

/// A platform message translated into the runtime's injection format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    pub sender: String,
    pub sender_display: Option<String>,
    pub content: String,
    /// Whether the owning agent was mentioned.
    pub mentioned: bool,
    pub channel: ChannelRef,
    pub posted_at: Option<DateTime<Utc>>,
}

/// One line of primed conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryLine {
    pub sender: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Context handed to the runtime when a session is bootstrapped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSeed {
    /// Task description for ephemeral sessions.
    pub title: Option<String>,
    /// Recent channel history, oldest first.
    pub history: Vec<HistoryLine>,
}

/// Interface to the external agent-hosting runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Bootstrap a session under the given key, priming it with context.
    /// Creating an already-existing session is an upsert, not an error.
    async fn create_session(&self, session_key: &str, seed: &SessionSeed)
    -> Result<(), RuntimeError>;

    /// Tear down a session. Destroying an absent session is not an error.
    async fn destroy_session(&self, session_key: &str) -> Result<(), RuntimeError>;

    /// Inject an inbound message into a session.
    async fn inject_message(
        &self,
        session_key: &str,
        message: &InboundMessage,
    ) -> Result<(), RuntimeError>;

    /// Execute a named command against a session, returning its textual
    /// output.
    async fn execute_command(
        &self,
        session_key: &str,
        name: &str,
        args: &[String],
    ) -> Result<String, RuntimeError>;
}

/// HTTP-backed implementation of the runtime contract.
pub struct HttpRuntime {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    name: &'a str,
    args: &'a [String],
}

#[derive(Deserialize)]
struct ExecuteResponse {
    output: String,
}

impl HttpRuntime {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RuntimeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn session_url(&self, session_key: &str) -> String {
        format!("{}/sessions/{}", self.base_url, session_key)
    }

    fn map_send_error(e: reqwest::Error) -> RuntimeError {
        if e.is_timeout() {
            RuntimeError::Timeout(e.to_string())
        } else {
            RuntimeError::Unavailable(e.to_string())
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RuntimeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::GONE {
            return Err(RuntimeError::SessionTerminated(body));
        }
        if status.is_server_error() {
            return Err(RuntimeError::Unavailable(format!("{}: {}", status, body)));
        }
        Err(RuntimeError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl AgentRuntime for HttpRuntime {
    async fn create_session(
        &self,
        session_key: &str,
        seed: &SessionSeed,
    ) -> Result<(), RuntimeError> {
        let response = self
            .http
            .put(self.session_url(session_key))
            .json(seed)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn destroy_session(&self, session_key: &str) -> Result<(), RuntimeError> {
        let response = self
            .http
            .delete(self.session_url(session_key))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        // An absent session is already destroyed.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn inject_message(
        &self,
        session_key: &str,
        message: &InboundMessage,
    ) -> Result<(), RuntimeError> {
        let response = self
            .http
            .post(format!("{}/messages", self.session_url(session_key)))
            .json(message)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn execute_command(
        &self,
        session_key: &str,
        name: &str,
        args: &[String],
    ) -> Result<String, RuntimeError> {
        let response = self
            .http
            .post(format!("{}/commands", self.session_url(session_key)))
            .json(&ExecuteRequest { name, args })
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let response = Self::check(response).await?;
        let result: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::Command(format!("malformed command output: {e}")))?;
        Ok(result.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_platform::ChannelKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn runtime(server: &MockServer) -> HttpRuntime {
        HttpRuntime::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn inbound() -> InboundMessage {
        InboundMessage {
            sender: "sam".into(),
            sender_display: Some("Sam".into()),
            content: "Can you review the PR?".into(),
            mentioned: true,
            channel: ChannelRef {
                org: "acme".into(),
                id: "ch_general".into(),
                kind: ChannelKind::Channel,
            },
            posted_at: None,
        }
    }

    #[tokio::test]
    async fn inject_posts_to_session_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/marvin/acme/channel/ch_general/messages"))
            .and(body_partial_json(serde_json::json!({
                "sender": "sam",
                "mentioned": true
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        runtime(&server)
            .inject_message("marvin/acme/channel/ch_general", &inbound())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn execute_returns_command_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/k/commands"))
            .and(body_partial_json(serde_json::json!({"name": "status"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"output": "3 tasks open"})),
            )
            .mount(&server)
            .await;

        let output = runtime(&server)
            .execute_command("k", "status", &[])
            .await
            .unwrap();
        assert_eq!(output, "3 tasks open");
    }

    #[tokio::test]
    async fn gone_session_maps_to_terminated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410).set_body_string("session expired"))
            .mount(&server)
            .await;

        let err = runtime(&server)
            .inject_message("k", &inbound())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SessionTerminated(_)));
    }

    #[tokio::test]
    async fn destroy_of_absent_session_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        runtime(&server).destroy_session("k").await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_runtime_maps_to_unavailable() {
        // Nothing listens on this port.
        let runtime = HttpRuntime::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let err = runtime.inject_message("k", &inbound()).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
