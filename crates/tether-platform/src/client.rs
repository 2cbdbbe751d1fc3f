//! HTTP client for the collaboration platform API.
//!
//! One client per agent identity: the bearer credential is scoped to
//! exactly one organization and one agent. Sub-agents get their own
//! client via [`PlatformClient::with_token`].

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::events::{ChannelRef, PlatformEvent};
use crate::secrets::Secret;
use crate::PlatformError;

/// How a created message should be rendered downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    CommandOutput,
    Notice,
}

/// Response from the message-creation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PostedMessage {
    pub id: String,
}

/// A message from the channel history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelMessage {
    pub id: String,
    pub sender: String,
    #[serde(default)]
    pub sender_display: Option<String>,
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    content: &'a str,
    mentions: &'a [String],
    kind: MessageKind,
}

#[derive(Deserialize)]
struct EventPage {
    events: Vec<PlatformEvent>,
}

#[derive(Deserialize)]
struct HistoryPage {
    messages: Vec<ChannelMessage>,
}

/// Client for the platform's REST and event endpoints.
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    token: Secret,
}

impl PlatformClient {
    /// Create a new client for the given platform URL and credential.
    pub fn new(
        base_url: impl Into<String>,
        token: Secret,
        tls_verify: bool,
    ) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!tls_verify)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// A client sharing this one's connection pool but authenticating
    /// with a different credential (sub-agent tokens).
    pub fn with_token(&self, token: Secret) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token,
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose())
    }

    /// Create a message in an org-scoped channel.
    ///
    /// No internal retry: the delivery policy (retry ladder, credential
    /// revocation handling) lives in the message relay.
    pub async fn post_message(
        &self,
        channel: &ChannelRef,
        content: &str,
        mentions: &[String],
        kind: MessageKind,
    ) -> Result<PostedMessage, PlatformError> {
        let url = format!(
            "{}/api/orgs/{}/channels/{}/messages",
            self.base_url, channel.org, channel.id
        );

        let response = self
            .http
            .post(&url)
            .header("Authorization", self.bearer())
            .json(&CreateMessageRequest {
                content,
                mentions,
                kind,
            })
            .send()
            .await?;

        let response = Self::check(response).await?;
        let posted: PostedMessage = response.json().await?;
        debug!(channel = %channel.id, message = %posted.id, "posted message");
        Ok(posted)
    }

    /// Fetch the most recent messages of a channel, oldest first.
    ///
    /// Used to prime a fresh runtime session; transient failures are
    /// retried briefly so a flaky read does not abort session creation.
    pub async fn fetch_history(
        &self,
        channel: &ChannelRef,
        limit: u32,
    ) -> Result<Vec<ChannelMessage>, PlatformError> {
        let url = format!(
            "{}/api/orgs/{}/channels/{}/messages",
            self.base_url, channel.org, channel.id
        );

        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(Duration::from_secs(10)))
            .build();

        let page: HistoryPage = backoff::future::retry(policy, || async {
            let result = async {
                let response = self
                    .http
                    .get(&url)
                    .header("Authorization", self.bearer())
                    .query(&[("limit", limit)])
                    .send()
                    .await?;
                let response = Self::check(response).await?;
                Ok::<HistoryPage, PlatformError>(response.json().await?)
            }
            .await;

            result.map_err(|e| {
                if e.is_retryable() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await?;

        let mut messages = page.messages;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    /// Poll the event list endpoint (degraded-mode fallback).
    pub async fn poll_events(
        &self,
        org: &str,
        after: i64,
        limit: u32,
    ) -> Result<Vec<PlatformEvent>, PlatformError> {
        let url = format!("{}/api/events", self.base_url);

        let response = self
            .http
            .get(&url)
            .header("Authorization", self.bearer())
            .query(&[("org", org.to_string()), ("after", after.to_string())])
            .query(&[("limit", limit)])
            .send()
            .await?;

        let response = Self::check(response).await?;
        let page: EventPage = response.json().await?;
        Ok(page.events)
    }

    /// Open the persistent event stream, resuming after `after` if known.
    pub async fn open_stream(
        &self,
        org: &str,
        after: Option<i64>,
    ) -> Result<EventStream, PlatformError> {
        let url = format!("{}/api/events/stream", self.base_url);

        let mut request = self
            .http
            .get(&url)
            .header("Authorization", self.bearer())
            .query(&[("org", org)]);
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }

        let response = request.send().await?;
        let response = Self::check(response).await?;
        Ok(EventStream::new(response))
    }

    /// Triage a response status into the error taxonomy.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Auth(format!("{}: {}", status, body)));
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(PlatformError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        Err(PlatformError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Line-delimited view over a streaming response body.
pub struct EventStream {
    lines: Lines<BufReader<StreamReader<ByteStream, Bytes>>>,
}

impl EventStream {
    fn new(response: reqwest::Response) -> Self {
        let bytes = response
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = StreamReader::new(Box::pin(bytes) as ByteStream);
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next raw line, or `None` when the server closes the stream.
    pub async fn next_line(&mut self) -> Result<Option<String>, PlatformError> {
        self.lines
            .next_line()
            .await
            .map_err(|e| PlatformError::Stream(e.to_string()))
    }
}
