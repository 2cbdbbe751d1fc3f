//! Daemon orchestration.
//!
//! The orchestrator owns the per-agent listener/router/relay tasks and
//! an explicit registry that the operational endpoints read from. All
//! tasks share one shutdown watch channel; each agent additionally has
//! a stop channel for permanent revocation. Shutdown is staged (stop
//! intake, flush outbound, persist cursors, detach sub-agents, close
//! connections) with a hard deadline.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use tether_platform::{
    ChannelKind, ChannelRef, ConnectionState, MessageKind, PlatformClient, StreamConfig,
    StreamListener,
};
use tether_runtime::{
    AgentRuntime, CommandRouter, DeliveryPolicy, HttpRuntime, MessageRelay, OutboundItem,
    RelayObserver, RelaySignal, SessionMapper, SubAgentManager,
};
use tether_store::StateStore;
use tether_web::{AgentStatus, AppState, Metrics, StatusSource, create_router};

use crate::config::Config;
use crate::router::{EventRouter, RouterContext};

/// Target is 10s; this is the hard stop.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

/// Cadence of the sub-agent expiry sweep and gauge refresh.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 256;
const WORKER_QUEUE_CAPACITY: usize = 64;
const UNAVAILABLE_ALERT_THRESHOLD: u32 = 6;
const RUNTIME_RETRY_DELAY: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the orchestrator tracks for one running agent.
pub struct AgentHandle {
    pub name: String,
    pub org: String,
    pub state_rx: watch::Receiver<ConnectionState>,
    pub stop_tx: Arc<watch::Sender<bool>>,
    pub resume: Arc<AtomicI64>,
    pub last_event: Arc<RwLock<Option<(i64, DateTime<Utc>)>>>,
    pub mapper: Arc<SessionMapper>,
    pub sub_agents: Arc<SubAgentManager>,
    pub relay: Arc<MessageRelay>,
}

/// Explicit connection registry owned by the orchestrator; components
/// that need it get a reference, there is no global state.
pub struct Registry {
    pub agents: Vec<AgentHandle>,
}

impl StatusSource for Registry {
    fn agent_statuses(&self) -> Vec<AgentStatus> {
        self.agents
            .iter()
            .map(|handle| {
                let committed = handle.resume.load(Ordering::Acquire);
                let last_at = handle
                    .last_event
                    .read()
                    .expect("status lock poisoned")
                    .map(|(_, at)| at);
                AgentStatus {
                    agent: handle.name.clone(),
                    org: handle.org.clone(),
                    connection: handle.state_rx.borrow().as_str().to_string(),
                    last_event_id: (committed >= 0).then_some(committed),
                    last_event_at: last_at,
                }
            })
            .collect()
    }

    fn session_counts(&self) -> (usize, usize) {
        let sessions = self.agents.iter().map(|h| h.mapper.active_count()).sum();
        let sub_agents = self.agents.iter().map(|h| h.sub_agents.active_count()).sum();
        (sessions, sub_agents)
    }
}

/// Feeds relay outcomes into the metrics registry.
struct MetricsObserver {
    metrics: Arc<Metrics>,
    agent: String,
}

impl RelayObserver for MetricsObserver {
    fn delivery_failed(&self) {
        self.metrics
            .delivery_failures_total
            .with_label_values(&[&self.agent])
            .inc();
    }

    fn outbound_dropped(&self) {
        self.metrics.outbound_dropped_total.inc();
    }
}

/// Run the bridge until a termination signal.
pub async fn run(config: Config) -> Result<()> {
    info!(agents = config.agents.len(), "starting tether bridge");

    let provider = config
        .build_provider()
        .map_err(|e| miette::miette!("{}", e))?;

    if let Some(parent) = config.store.path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| miette::miette!("cannot create store directory: {}", e))?;
    }
    let store = Arc::new(
        StateStore::open(&config.store.path)
            .await
            .map_err(|e| miette::miette!("{}", e))?,
    );

    // Sub-agent sessions detached by the previous shutdown resume now.
    match store.reactivate_detached_sub_agents().await {
        Ok(0) => {}
        Ok(count) => info!(count, "re-activated detached sub-agent sessions"),
        Err(e) => warn!(error = %e, "could not re-activate detached sub-agent sessions"),
    }

    let metrics = Arc::new(Metrics::new().map_err(|e| miette::miette!("{}", e))?);

    let runtime: Arc<dyn AgentRuntime> = Arc::new(
        HttpRuntime::new(
            &config.runtime.url,
            Duration::from_secs(config.runtime.timeout_secs),
        )
        .map_err(|e| miette::miette!("{}", e))?,
    );

    let fallback = config.fallback_channel.as_ref().map(|f| ChannelRef {
        org: f.org.clone(),
        id: f.id.clone(),
        kind: ChannelKind::Channel,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    let stream_config = StreamConfig {
        read_timeout: Duration::from_secs(config.heartbeat.timeout_secs),
        ..StreamConfig::default()
    };

    let mut agents = Vec::new();
    let mut listener_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut router_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut relay_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut aux_handles: Vec<JoinHandle<()>> = Vec::new();

    for agent in &config.agents {
        if !agent.auto_subscribe {
            info!(agent = %agent.name, "auto-subscribe disabled, not connecting");
            continue;
        }

        let token = provider.resolve(&agent.credential).await.map_err(|e| {
            miette::miette!("credential '{}' for agent '{}': {}", agent.credential, agent.name, e)
        })?;
        let client = Arc::new(
            PlatformClient::new(&config.platform_url, token, config.tls_verify)
                .map_err(|e| miette::miette!("{}", e))?,
        );

        let resume_value = match store.cursor(&agent.name, &agent.org).await {
            Ok(Some(cursor)) => {
                info!(agent = %agent.name, cursor, "resuming from persisted cursor");
                cursor
            }
            Ok(None) => -1,
            Err(e) => {
                warn!(agent = %agent.name, error = %e, "failed to load cursor, starting fresh");
                -1
            }
        };
        let resume = Arc::new(AtomicI64::new(resume_value));

        let mapper = Arc::new(SessionMapper::new(
            &agent.name,
            client.clone(),
            runtime.clone(),
            store.clone(),
            agent.history_depth,
        ));
        match mapper.load_persisted().await {
            Ok(0) => {}
            Ok(count) => info!(agent = %agent.name, count, "restored session mappings"),
            Err(e) => warn!(agent = %agent.name, error = %e, "could not restore session mappings"),
        }

        let (signal_tx, mut signal_rx) = mpsc::channel(4);
        let relay = Arc::new(
            MessageRelay::new(
                &agent.name,
                client.clone(),
                runtime.clone(),
                DeliveryPolicy::default(),
                signal_tx,
            )
            .with_observer(Arc::new(MetricsObserver {
                metrics: metrics.clone(),
                agent: agent.name.clone(),
            })),
        );
        let commands = Arc::new(CommandRouter::new(
            &config.command_marker,
            runtime.clone(),
            relay.clone(),
            COMMAND_TIMEOUT,
        ));
        let sub_agents = Arc::new(SubAgentManager::new(
            mapper.clone(),
            store.clone(),
            provider.clone(),
        ));
        match sub_agents.load_persisted().await {
            Ok(0) => {}
            Ok(count) => info!(agent = %agent.name, count, "restored sub-agent sessions"),
            Err(e) => warn!(agent = %agent.name, error = %e, "could not restore sub-agent sessions"),
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let (listener, state_rx) = StreamListener::new(
            &agent.name,
            &agent.org,
            client.clone(),
            resume.clone(),
            stream_config.clone(),
        );

        let last_event = Arc::new(RwLock::new(None));

        let ctx = Arc::new(RouterContext {
            agent: agent.name.clone(),
            org: agent.org.clone(),
            relay: relay.clone(),
            commands,
            mapper: mapper.clone(),
            sub_agents: sub_agents.clone(),
            store: store.clone(),
            resume: resume.clone(),
            metrics: metrics.clone(),
            stop_tx: stop_tx.clone(),
            last_event: last_event.clone(),
            shutdown: shutdown_rx.clone(),
            worker_queue: WORKER_QUEUE_CAPACITY,
            unavailable_alert_threshold: UNAVAILABLE_ALERT_THRESHOLD,
            runtime_retry_delay: RUNTIME_RETRY_DELAY,
            fallback: fallback.clone(),
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        listener_handles.push({
            let shutdown_rx = shutdown_rx.clone();
            let stop_rx = stop_rx.clone();
            let agent_name = agent.name.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.run(events_tx, shutdown_rx, stop_rx).await {
                    error!(agent = %agent_name, error = %e, "stream listener stopped with error");
                }
            })
        });

        router_handles.push({
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { EventRouter::new(ctx).run(events_rx).await })
        });

        relay_handles.push({
            let relay = relay.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { relay.run(shutdown_rx).await })
        });

        // Credential revocation detected on the outbound path stops the
        // agent just like an inbound auth failure.
        aux_handles.push({
            let stop_tx = stop_tx.clone();
            let agent_name = agent.name.clone();
            tokio::spawn(async move {
                while let Some(RelaySignal::CredentialRevoked) = signal_rx.recv().await {
                    error!(agent = %agent_name, "credential revoked, stopping agent");
                    let _ = stop_tx.send(true);
                }
            })
        });

        aux_handles.push(tokio::spawn(observe_connection(
            agent.name.clone(),
            state_rx.clone(),
            metrics.clone(),
            relay.clone(),
            fallback.clone(),
            shutdown_rx.clone(),
        )));

        agents.push(AgentHandle {
            name: agent.name.clone(),
            org: agent.org.clone(),
            state_rx,
            stop_tx,
            resume,
            last_event,
            mapper,
            sub_agents,
            relay,
        });
    }

    if agents.is_empty() {
        return Err(miette::miette!("no agents with auto_subscribe enabled"));
    }

    let registry = Arc::new(Registry { agents });

    // Expiry sweep + gauge refresh.
    aux_handles.push({
        let registry = registry.clone();
        let metrics = metrics.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = interval.tick() => {
                        for agent in &registry.agents {
                            let swept = agent.sub_agents.sweep_expired().await;
                            if !swept.is_empty() {
                                info!(agent = %agent.name, count = swept.len(), "swept expired sub-agent sessions");
                            }
                        }
                        let (sessions, sub_agents) = registry.session_counts();
                        metrics.active_sessions.set(sessions as i64);
                        metrics.active_sub_agents.set(sub_agents as i64);
                    }
                }
            }
        })
    });

    // Operational endpoints.
    let app_state = Arc::new(AppState {
        metrics: metrics.clone(),
        source: registry.clone(),
        started_at: std::time::Instant::now(),
    });
    let web_listener = tokio::net::TcpListener::bind(config.web.bind)
        .await
        .map_err(|e| miette::miette!("cannot bind {}: {}", config.web.bind, e))?;
    info!(bind = %config.web.bind, "operational endpoints listening");
    let web_handle = {
        let mut shutdown_rx = shutdown_rx.clone();
        let router = create_router(app_state);
        tokio::spawn(async move {
            let shutdown = async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            };
            if let Err(e) = axum::serve(web_listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "web server error");
            }
        })
    };

    // Wait for the termination signal.
    let mut main_rx = shutdown_rx.clone();
    loop {
        if main_rx.changed().await.is_err() || *main_rx.borrow() {
            break;
        }
    }

    info!("shutting down");
    let started = Instant::now();

    let graceful = async {
        // Routers flush their channel workers and persist cursors.
        for handle in router_handles {
            let _ = handle.await;
        }
        // Delivery workers flush the outbound queues.
        for handle in relay_handles {
            let _ = handle.await;
        }
        // Active sub-agent sessions survive the restart as detached.
        match store.detach_active_sub_agents().await {
            Ok(0) => {}
            Ok(count) => info!(count, "detached active sub-agent sessions"),
            Err(e) => warn!(error = %e, "could not detach sub-agent sessions"),
        }
        for handle in listener_handles {
            let _ = handle.await;
        }
        for handle in &aux_handles {
            handle.abort();
        }
        let _ = web_handle.await;
    };

    match tokio::time::timeout(SHUTDOWN_DEADLINE, graceful).await {
        Ok(()) => {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "daemon shut down gracefully"
            );
        }
        Err(_) => {
            // A few events may be reprocessed after restart; processing
            // is idempotent via the cursor and duplicate check.
            warn!(
                deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
                "shutdown deadline exceeded, forcing exit"
            );
        }
    }

    Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
        }
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });
}

/// Watch one agent's connection state: count reconnects, post the
/// one-time degradation notice, and alert when the listener parks in
/// its terminal state.
async fn observe_connection(
    agent: String,
    mut state_rx: watch::Receiver<ConnectionState>,
    metrics: Arc<Metrics>,
    relay: Arc<MessageRelay>,
    fallback: Option<ChannelRef>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut degraded_notified = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Reconnecting => {
                        metrics.reconnects_total.with_label_values(&[&agent]).inc();
                    }
                    ConnectionState::Degraded => {
                        if !degraded_notified {
                            degraded_notified = true;
                            warn!(agent = %agent, "stream degraded, polling in effect");
                            if let Some(channel) = &fallback {
                                relay
                                    .enqueue(OutboundItem::new(
                                        channel.clone(),
                                        format!(
                                            "Event stream for {agent} is degraded; falling back to polling."
                                        ),
                                        MessageKind::Notice,
                                    ))
                                    .await;
                            }
                        }
                    }
                    ConnectionState::Connected => {
                        degraded_notified = false;
                    }
                    ConnectionState::Stopped => {
                        error!(agent = %agent, "listener stopped permanently, operator action required");
                        if let Some(channel) = &fallback {
                            relay
                                .enqueue(OutboundItem::new(
                                    channel.clone(),
                                    format!(
                                        "Agent {agent} stopped: credential invalid or session revoked."
                                    ),
                                    MessageKind::Notice,
                                ))
                                .await;
                        }
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
