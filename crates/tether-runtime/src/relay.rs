//! Message relay between the platform and the agent runtime.
//!
//! Inbound: platform messages are translated into the runtime's
//! injection format and delivered with a timeout. Outbound: agent
//! output is queued in a bounded in-memory deque (dropped oldest-first
//! on overflow) and delivered by an independent worker task so the
//! inbound loop is never blocked on a slow post.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

use tether_platform::{ChannelRef, MessageKind, MessagePayload, PlatformClient, Secret};

use crate::runtime::{AgentRuntime, InboundMessage};
use crate::RuntimeError;

/// Hooks for delivery accounting (metrics live in the binary).
pub trait RelayObserver: Send + Sync {
    fn delivered(&self) {}
    fn delivery_failed(&self) {}
    fn outbound_dropped(&self) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl RelayObserver for NullObserver {}

/// Signals surfaced to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySignal {
    /// The agent's own credential was rejected; the listener must stop
    /// permanently.
    CredentialRevoked,
}

/// Outbound delivery tunables.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Delays between attempts on retryable failures.
    pub retry_delays: Vec<Duration>,
    /// Per-injection timeout for inbound delivery.
    pub inject_timeout: Duration,
    /// Bound of the outbound queue.
    pub queue_capacity: usize,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            inject_timeout: Duration::from_secs(30),
            queue_capacity: 256,
        }
    }
}

/// One queued outbound message.
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub channel: ChannelRef,
    pub content: String,
    pub mentions: Vec<String>,
    pub kind: MessageKind,
    /// Credential override for sub-agent sessions; the agent's own
    /// credential is used when absent.
    pub token: Option<Secret>,
    pub attempt_count: u32,
    pub first_enqueued_at: DateTime<Utc>,
}

impl OutboundItem {
    pub fn new(channel: ChannelRef, content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            channel,
            content: content.into(),
            mentions: Vec::new(),
            kind,
            token: None,
            attempt_count: 0,
            first_enqueued_at: Utc::now(),
        }
    }

    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn with_token(mut self, token: Option<Secret>) -> Self {
        self.token = token;
        self
    }
}

/// Bidirectional relay for one agent.
pub struct MessageRelay {
    agent: String,
    client: Arc<PlatformClient>,
    runtime: Arc<dyn AgentRuntime>,
    queue: Mutex<VecDeque<OutboundItem>>,
    notify: Notify,
    policy: DeliveryPolicy,
    signal_tx: mpsc::Sender<RelaySignal>,
    observer: Arc<dyn RelayObserver>,
}

impl MessageRelay {
    pub fn new(
        agent: impl Into<String>,
        client: Arc<PlatformClient>,
        runtime: Arc<dyn AgentRuntime>,
        policy: DeliveryPolicy,
        signal_tx: mpsc::Sender<RelaySignal>,
    ) -> Self {
        Self {
            agent: agent.into(),
            client,
            runtime,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            policy,
            signal_tx,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RelayObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Translate a platform message into the runtime injection format.
    pub fn translate_inbound(
        agent: &str,
        channel: &ChannelRef,
        payload: &MessagePayload,
        posted_at: Option<DateTime<Utc>>,
    ) -> InboundMessage {
        InboundMessage {
            sender: payload.sender.clone(),
            sender_display: payload.sender_display.clone(),
            content: payload.content.clone(),
            mentioned: payload.mentions.iter().any(|m| m == agent),
            channel: channel.clone(),
            posted_at,
        }
    }

    /// Deliver an inbound message to the runtime, bounded by the
    /// injection timeout.
    pub async fn deliver_inbound(
        &self,
        session_key: &str,
        message: &InboundMessage,
    ) -> Result<(), RuntimeError> {
        match tokio::time::timeout(
            self.policy.inject_timeout,
            self.runtime.inject_message(session_key, message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(format!(
                "injection into {} exceeded {}s",
                session_key,
                self.policy.inject_timeout.as_secs()
            ))),
        }
    }

    /// Queue an outbound item, dropping the oldest on overflow.
    pub async fn enqueue(&self, item: OutboundItem) {
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.policy.queue_capacity {
                let dropped = queue.pop_front();
                self.observer.outbound_dropped();
                warn!(
                    agent = %self.agent,
                    channel = ?dropped.map(|d| d.channel.id),
                    "outbound queue full, dropping oldest item"
                );
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Snapshot of the outbound queue, oldest first.
    pub async fn queued_items(&self) -> Vec<OutboundItem> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Delivery worker loop. Exits once shutdown is signalled and the
    /// queue has been flushed; unsendable items are discarded with a
    /// logged warning.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(agent = %self.agent, "outbound delivery worker started");

        loop {
            let item = { self.queue.lock().await.pop_front() };

            if let Some(item) = item {
                if let Err(e) = self.deliver(item).await {
                    warn!(agent = %self.agent, error = %e, "discarding unsendable outbound item");
                }
                continue;
            }

            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = self.notify.notified() => {}
            }
        }

        info!(agent = %self.agent, "outbound delivery worker stopped");
    }

    /// Attempt delivery with the configured retry ladder.
    ///
    /// 5xx and transport failures retry up to the ladder's length; 4xx
    /// never retries; a credential rejection on the agent's own token
    /// triggers the stop-agent signal.
    pub async fn deliver(&self, mut item: OutboundItem) -> Result<(), RuntimeError> {
        let max_attempts = self.policy.retry_delays.len() as u32 + 1;

        loop {
            item.attempt_count += 1;

            let result = match &item.token {
                Some(token) => {
                    self.client
                        .with_token(token.clone())
                        .post_message(&item.channel, &item.content, &item.mentions, item.kind)
                        .await
                }
                None => {
                    self.client
                        .post_message(&item.channel, &item.content, &item.mentions, item.kind)
                        .await
                }
            };

            match result {
                Ok(posted) => {
                    debug!(
                        agent = %self.agent,
                        channel = %item.channel.id,
                        message = %posted.id,
                        attempts = item.attempt_count,
                        "outbound delivered"
                    );
                    self.observer.delivered();
                    return Ok(());
                }
                Err(e) if e.is_auth() => {
                    error!(
                        agent = %self.agent,
                        channel = %item.channel.id,
                        error = %e,
                        "credential rejected on outbound delivery"
                    );
                    self.observer.delivery_failed();
                    if item.token.is_none() {
                        let _ = self.signal_tx.try_send(RelaySignal::CredentialRevoked);
                    }
                    return Err(e.into());
                }
                Err(e) if e.is_retryable() && item.attempt_count < max_attempts => {
                    let delay = self.policy.retry_delays[(item.attempt_count - 1) as usize];
                    warn!(
                        agent = %self.agent,
                        channel = %item.channel.id,
                        attempt = item.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "outbound delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        agent = %self.agent,
                        channel = %item.channel.id,
                        attempts = item.attempt_count,
                        error = %e,
                        "outbound delivery failed"
                    );
                    self.observer.delivery_failed();
                    if e.is_retryable() {
                        // Retries exhausted: tell the channel, best effort.
                        self.post_failure_notice(&item).await;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn post_failure_notice(&self, item: &OutboundItem) {
        if item.kind == MessageKind::Notice {
            // A notice about a notice would loop.
            return;
        }
        let text = format!(
            "Failed to deliver a message to this channel after {} attempts.",
            item.attempt_count
        );
        if let Err(e) = self
            .client
            .post_message(&item.channel, &text, &[], MessageKind::Notice)
            .await
        {
            debug!(agent = %self.agent, error = %e, "failure notice could not be posted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;
    use tether_platform::ChannelKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel() -> ChannelRef {
        ChannelRef {
            org: "acme".into(),
            id: "ch_general".into(),
            kind: ChannelKind::Channel,
        }
    }

    fn fast_policy() -> DeliveryPolicy {
        DeliveryPolicy {
            retry_delays: vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
            ],
            inject_timeout: Duration::from_millis(200),
            queue_capacity: 2,
        }
    }

    fn relay(server: &MockServer) -> (MessageRelay, mpsc::Receiver<RelaySignal>) {
        let client =
            Arc::new(PlatformClient::new(server.uri(), Secret::new("tok_agent"), true).unwrap());
        let (signal_tx, signal_rx) = mpsc::channel(4);
        (
            MessageRelay::new(
                "marvin",
                client,
                Arc::new(MockRuntime::default()),
                fast_policy(),
                signal_tx,
            ),
            signal_rx,
        )
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/orgs/acme/channels/ch_general/messages"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/orgs/acme/channels/ch_general/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (relay, _signals) = relay(&server);
        relay
            .deliver(OutboundItem::new(channel(), "hello", MessageKind::Chat))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_post_a_channel_notice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/orgs/acme/channels/ch_general/messages"))
            .and(body_partial_json(serde_json::json!({"kind": "chat"})))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/orgs/acme/channels/ch_general/messages"))
            .and(body_partial_json(serde_json::json!({"kind": "notice"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_notice"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (relay, _signals) = relay(&server);
        let err = relay
            .deliver(OutboundItem::new(channel(), "hello", MessageKind::Chat))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Platform(tether_platform::PlatformError::Api { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let (relay, _signals) = relay(&server);
        let err = relay
            .deliver(OutboundItem::new(channel(), "hello", MessageKind::Chat))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Platform(tether_platform::PlatformError::Api { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn credential_rejection_signals_the_orchestrator() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("revoked"))
            .expect(1)
            .mount(&server)
            .await;

        let (relay, mut signals) = relay(&server);
        let err = relay
            .deliver(OutboundItem::new(channel(), "hello", MessageKind::Chat))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Platform(tether_platform::PlatformError::Auth(_))
        ));
        assert_eq!(signals.try_recv().unwrap(), RelaySignal::CredentialRevoked);
    }

    #[tokio::test]
    async fn sub_agent_credential_rejection_does_not_stop_the_agent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (relay, mut signals) = relay(&server);
        let item = OutboundItem::new(channel(), "hello", MessageKind::Chat)
            .with_token(Some(Secret::new("tok_sub")));
        relay.deliver(item).await.unwrap_err();
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_first() {
        let server = MockServer::start().await;
        let (relay, _signals) = relay(&server);

        for content in ["one", "two", "three"] {
            relay
                .enqueue(OutboundItem::new(channel(), content, MessageKind::Chat))
                .await;
        }

        let queue = relay.queue.lock().await;
        let contents: Vec<&str> = queue.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn translate_inbound_flags_mentions() {
        let payload = MessagePayload {
            message_id: "m1".into(),
            sender: "sam".into(),
            sender_display: None,
            content: "@marvin please review".into(),
            mentions: vec!["marvin".into()],
        };
        let message = MessageRelay::translate_inbound("marvin", &channel(), &payload, None);
        assert!(message.mentioned);

        let message = MessageRelay::translate_inbound("bender", &channel(), &payload, None);
        assert!(!message.mentioned);
    }

    #[tokio::test]
    async fn inject_timeout_maps_to_timeout_error() {
        let server = MockServer::start().await;
        let client =
            Arc::new(PlatformClient::new(server.uri(), Secret::new("tok"), true).unwrap());
        let (signal_tx, _rx) = mpsc::channel(1);

        let runtime = Arc::new(MockRuntime::default());
        runtime.set_inject_delay(Duration::from_secs(5));

        let relay = MessageRelay::new("marvin", client, runtime, fast_policy(), signal_tx);
        let message = MessageRelay::translate_inbound(
            "marvin",
            &channel(),
            &MessagePayload {
                message_id: "m1".into(),
                sender: "sam".into(),
                sender_display: None,
                content: "hi".into(),
                mentions: vec![],
            },
            None,
        );

        let err = relay.deliver_inbound("k", &message).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout(_)));
    }
}
