//! Persistent event stream listener.
//!
//! One listener per configured agent identity. Runs a reconnection loop
//! with exponential backoff and jitter, resumes from the last committed
//! cursor, and falls back to polling the list endpoint when the stream
//! cannot be re-established for a sustained period.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::{EventStream, PlatformClient};
use crate::events::PlatformEvent;
use crate::PlatformError;

/// Observable state of one agent's stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Stream down for too long; polling the list endpoint instead.
    Degraded,
    /// Terminal: credential revoked or upstream ordered a stop.
    Stopped,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Stopped => "stopped",
        }
    }
}

/// Tunables for the listener.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Watchdog: no data (keep-alives included) for this long kills the
    /// connection.
    pub read_timeout: Duration,
    /// A connection that stays up this long resets the backoff to base.
    pub stability_threshold: Duration,
    /// Time spent reconnecting before switching to degraded polling.
    pub degraded_after: Duration,
    /// Poll cadence while degraded.
    pub poll_interval: Duration,
    /// Page size for degraded polls.
    pub poll_limit: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(90),
            stability_threshold: Duration::from_secs(30),
            degraded_after: Duration::from_secs(300),
            poll_interval: Duration::from_secs(15),
            poll_limit: 100,
        }
    }
}

/// Exponential reconnect delay: base 1s, doubling to a 60s cap.
///
/// The nominal delay is deterministic (and non-decreasing until reset);
/// jitter is applied separately at the sleep site.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// The delay to use for the next attempt; doubles for the one after.
    pub fn next_nominal(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Back to base after a stable connection.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Apply ±25% jitter to a nominal delay.
    pub fn jittered(nominal: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        nominal.mul_f64(factor)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Maintains one persistent inbound event connection for one agent.
pub struct StreamListener {
    agent: String,
    org: String,
    client: Arc<PlatformClient>,
    config: StreamConfig,
    /// Last committed event id, shared with the router which advances it.
    /// Negative means no cursor is known yet.
    resume: Arc<AtomicI64>,
    state_tx: watch::Sender<ConnectionState>,
}

impl StreamListener {
    pub fn new(
        agent: impl Into<String>,
        org: impl Into<String>,
        client: Arc<PlatformClient>,
        resume: Arc<AtomicI64>,
        config: StreamConfig,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                agent: agent.into(),
                org: org.into(),
                client,
                config,
                resume,
                state_tx,
            },
            state_rx,
        )
    }

    fn set_state(&self, state: ConnectionState) {
        trace!(agent = %self.agent, state = state.as_str(), "connection state");
        let _ = self.state_tx.send(state);
    }

    fn resume_cursor(&self) -> Option<i64> {
        let value = self.resume.load(Ordering::Acquire);
        (value >= 0).then_some(value)
    }

    /// Run until shutdown, per-agent stop, or a terminal auth failure.
    ///
    /// Events are emitted into `events_tx` in arrival order; the receiver
    /// side is the router's single consumer loop. `shutdown_rx` is the
    /// process-wide signal; `stop_rx` stops this agent permanently
    /// (session revocation) and parks the listener in `Stopped`.
    pub async fn run(
        &self,
        events_tx: mpsc::Sender<PlatformEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<(), PlatformError> {
        let mut policy = ReconnectPolicy::default();
        let mut reconnecting_since: Option<Instant> = None;
        let mut first_attempt = true;

        loop {
            if *shutdown_rx.borrow() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }
            if *stop_rx.borrow() {
                self.set_state(ConnectionState::Stopped);
                return Ok(());
            }

            if first_attempt {
                self.set_state(ConnectionState::Connecting);
                first_attempt = false;
            }

            let resume = self.resume_cursor();
            info!(agent = %self.agent, org = %self.org, cursor = ?resume, "connecting to event stream");

            match self.client.open_stream(&self.org, resume).await {
                Ok(stream) => {
                    self.set_state(ConnectionState::Connected);
                    reconnecting_since = None;
                    let connected_at = Instant::now();

                    match self
                        .consume(stream, &events_tx, &mut shutdown_rx, &mut stop_rx)
                        .await
                    {
                        Ok(End::Shutdown) => {
                            self.set_state(ConnectionState::Disconnected);
                            return Ok(());
                        }
                        Ok(End::Stopped) => {
                            self.set_state(ConnectionState::Stopped);
                            return Ok(());
                        }
                        Err(e) if e.is_auth() => {
                            error!(agent = %self.agent, error = %e, "credential rejected, stopping listener");
                            self.set_state(ConnectionState::Stopped);
                            return Err(e);
                        }
                        Err(e) => {
                            if connected_at.elapsed() >= self.config.stability_threshold {
                                policy.reset();
                            }
                            warn!(agent = %self.agent, error = %e, "stream disconnected");
                        }
                    }
                }
                Err(e) if e.is_auth() => {
                    error!(agent = %self.agent, error = %e, "credential rejected, stopping listener");
                    self.set_state(ConnectionState::Stopped);
                    return Err(e);
                }
                Err(e) => {
                    warn!(agent = %self.agent, error = %e, "stream connect failed");
                }
            }

            let since = *reconnecting_since.get_or_insert_with(Instant::now);
            self.set_state(ConnectionState::Reconnecting);

            if since.elapsed() >= self.config.degraded_after {
                warn!(agent = %self.agent, "stream down too long, entering degraded polling");
                self.set_state(ConnectionState::Degraded);
                match self
                    .run_degraded(&events_tx, &mut shutdown_rx, &mut stop_rx)
                    .await
                {
                    Ok(DegradedEnd::Shutdown) => {
                        self.set_state(ConnectionState::Disconnected);
                        return Ok(());
                    }
                    Ok(DegradedEnd::Stopped) => {
                        self.set_state(ConnectionState::Stopped);
                        return Ok(());
                    }
                    Ok(DegradedEnd::StreamBack) => {
                        // Fresh connection will be made on the next loop
                        // iteration with a reset backoff.
                        reconnecting_since = None;
                        policy.reset();
                        continue;
                    }
                    Err(e) => {
                        error!(agent = %self.agent, error = %e, "credential rejected while degraded");
                        self.set_state(ConnectionState::Stopped);
                        return Err(e);
                    }
                }
            }

            let delay = ReconnectPolicy::jittered(policy.next_nominal());
            debug!(agent = %self.agent, delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = stop_rx.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Read the connected stream until shutdown, stop, or failure.
    async fn consume(
        &self,
        mut stream: EventStream,
        events_tx: &mpsc::Sender<PlatformEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<End, PlatformError> {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(End::Shutdown);
                    }
                }

                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(End::Stopped);
                    }
                }

                result = tokio::time::timeout(self.config.read_timeout, stream.next_line()) => {
                    match result {
                        Err(_) => {
                            return Err(PlatformError::Stream(format!(
                                "no data for {}s, forcing reconnect",
                                self.config.read_timeout.as_secs()
                            )));
                        }
                        Ok(Ok(Some(line))) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<PlatformEvent>(&line) {
                                Ok(event) => {
                                    if event.is_keep_alive() {
                                        trace!(agent = %self.agent, "keep-alive");
                                        continue;
                                    }
                                    if events_tx.send(event).await.is_err() {
                                        // Router gone; treat as shutdown.
                                        return Ok(End::Shutdown);
                                    }
                                }
                                Err(e) => {
                                    warn!(agent = %self.agent, error = %e, "skipping malformed event line");
                                }
                            }
                        }
                        Ok(Ok(None)) => {
                            return Err(PlatformError::Stream("stream ended by server".into()));
                        }
                        Ok(Err(e)) => {
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Degraded mode: poll the list endpoint until the stream comes back.
    ///
    /// Each tick first attempts a fresh stream connection; only when that
    /// fails does it fall back to a poll. The one-time degradation notice
    /// is posted by the orchestrator, which observes the state watch.
    async fn run_degraded(
        &self,
        events_tx: &mpsc::Sender<PlatformEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<DegradedEnd, PlatformError> {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(DegradedEnd::Shutdown);
                    }
                }

                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(DegradedEnd::Stopped);
                    }
                }

                _ = interval.tick() => {
                    // Probe the stream first so we leave degraded mode as
                    // soon as the upstream recovers.
                    match self.client.open_stream(&self.org, self.resume_cursor()).await {
                        Ok(_probe) => {
                            info!(agent = %self.agent, "stream reachable again, leaving degraded mode");
                            return Ok(DegradedEnd::StreamBack);
                        }
                        Err(e) if e.is_auth() => return Err(e),
                        Err(_) => {}
                    }

                    let after = self.resume_cursor().unwrap_or(0);
                    match self.client.poll_events(&self.org, after, self.config.poll_limit).await {
                        Ok(events) => {
                            debug!(agent = %self.agent, count = events.len(), "degraded poll");
                            for event in events {
                                if event.is_keep_alive() {
                                    continue;
                                }
                                if events_tx.send(event).await.is_err() {
                                    return Ok(DegradedEnd::Shutdown);
                                }
                            }
                        }
                        Err(e) if e.is_auth() => return Err(e),
                        Err(e) => {
                            warn!(agent = %self.agent, error = %e, "degraded poll failed");
                        }
                    }
                }
            }
        }
    }
}

enum End {
    Shutdown,
    Stopped,
}

enum DegradedEnd {
    Shutdown,
    Stopped,
    StreamBack,
}
