//! Event routing for one agent's stream.
//!
//! A single consumer loop takes events in arrival order, discards
//! self-authored and duplicate events, classifies the rest, and hands
//! message/command work to per-channel worker tasks (created on first
//! use, keyed by channel id). Within one channel order is preserved;
//! across channels work proceeds concurrently. The cursor is committed
//! only once every event at or below it has been fully processed.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::sync::atomic::AtomicI64;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tether_platform::{
    ChannelRef, CommandPayload, EventClass, LifecycleEvent, MessageKind, MessagePayload,
    PlatformEvent,
};
use tether_runtime::{
    CommandRouter, CursorTracker, MessageRelay, OutboundItem, SessionMapper, SubAgentManager,
    session_key,
};
use tether_store::StateStore;
use tether_web::Metrics;

/// Everything a router and its channel workers need, shared by `Arc`.
pub struct RouterContext {
    pub agent: String,
    pub org: String,
    pub relay: Arc<MessageRelay>,
    pub commands: Arc<CommandRouter>,
    pub mapper: Arc<SessionMapper>,
    pub sub_agents: Arc<SubAgentManager>,
    pub store: Arc<StateStore>,
    /// Last committed event id, shared with the listener for resume.
    pub resume: Arc<AtomicI64>,
    pub metrics: Arc<Metrics>,
    /// Stops this agent permanently (session revocation).
    pub stop_tx: Arc<watch::Sender<bool>>,
    /// (id, received-at) of the newest event, for `/status`.
    pub last_event: Arc<RwLock<Option<(i64, DateTime<Utc>)>>>,
    pub shutdown: watch::Receiver<bool>,
    /// Bound of each channel worker's queue; a full queue applies
    /// backpressure to the consumer loop instead of dropping.
    pub worker_queue: usize,
    /// Consecutive runtime failures before the unreachability alert.
    pub unavailable_alert_threshold: u32,
    /// Delay between retries while the runtime is unreachable.
    pub runtime_retry_delay: Duration,
    pub fallback: Option<ChannelRef>,
}

enum WorkKind {
    Chat(MessagePayload, Option<DateTime<Utc>>),
    Command(CommandPayload),
}

struct WorkItem {
    id: i64,
    kind: WorkKind,
}

/// Consumer loop over one agent's event sequence.
pub struct EventRouter {
    ctx: Arc<RouterContext>,
}

impl EventRouter {
    pub fn new(ctx: Arc<RouterContext>) -> Self {
        Self { ctx }
    }

    /// Run until shutdown or until the listener closes the channel.
    /// On exit, queued per-channel work is flushed and the final cursor
    /// position is persisted.
    pub async fn run(&self, mut events_rx: mpsc::Receiver<PlatformEvent>) {
        let ctx = &self.ctx;
        let mut shutdown_rx = ctx.shutdown.clone();

        let initial = ctx.resume.load(Ordering::Acquire).max(0);
        let mut tracker = CursorTracker::new(initial);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<i64>();
        let mut workers: HashMap<String, mpsc::Sender<WorkItem>> = HashMap::new();
        let mut join_set: JoinSet<()> = JoinSet::new();

        info!(agent = %ctx.agent, cursor = initial, "event router started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                Some(id) = done_rx.recv() => {
                    self.on_complete(&mut tracker, id).await;
                }

                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.route(event, &mut tracker, &mut workers, &mut join_set, &done_tx)
                                .await;
                        }
                        None => break,
                    }
                }
            }
        }

        // Stop intake and let workers flush what they already hold.
        drop(workers);
        drop(done_tx);
        while join_set.join_next().await.is_some() {}
        while let Some(id) = done_rx.recv().await {
            self.on_complete(&mut tracker, id).await;
        }

        // Final persist, retrying any commit that failed mid-run.
        let committed = tracker.committed();
        if committed > 0
            && let Err(e) = ctx.store.commit_cursor(&ctx.agent, &ctx.org, committed).await
        {
            warn!(agent = %ctx.agent, error = %e, "final cursor persist failed");
        }

        info!(agent = %ctx.agent, cursor = committed, "event router stopped");
    }

    async fn route(
        &self,
        event: PlatformEvent,
        tracker: &mut CursorTracker,
        workers: &mut HashMap<String, mpsc::Sender<WorkItem>>,
        join_set: &mut JoinSet<()>,
        done_tx: &mpsc::UnboundedSender<i64>,
    ) {
        let ctx = &self.ctx;
        let Some(id) = event.id else {
            return;
        };

        ctx.metrics
            .events_total
            .with_label_values(&[event.kind.as_str()])
            .inc();
        *ctx.last_event.write().expect("status lock poisoned") = Some((id, Utc::now()));

        if tracker.is_duplicate(id) {
            debug!(agent = %ctx.agent, id, "discarding duplicate event");
            return;
        }

        // Self-loop check: our own relayed output must not come back as
        // new input.
        if event.actor.as_deref() == Some(ctx.agent.as_str()) {
            debug!(agent = %ctx.agent, id, "discarding self-authored event");
            self.finish_inline(tracker, id).await;
            return;
        }

        let class = match event.classify() {
            Ok(class) => class,
            Err(e) => {
                warn!(agent = %ctx.agent, id, kind = %event.kind, error = %e, "malformed event payload, skipping");
                self.finish_inline(tracker, id).await;
                return;
            }
        };

        match class {
            EventClass::KeepAlive => {}
            EventClass::Message(payload) => {
                let kind = WorkKind::Chat(payload, event.ts);
                self.dispatch(&event, WorkItem { id, kind }, tracker, workers, join_set, done_tx)
                    .await;
            }
            EventClass::Command(payload) => {
                let kind = WorkKind::Command(payload);
                self.dispatch(&event, WorkItem { id, kind }, tracker, workers, join_set, done_tx)
                    .await;
            }
            EventClass::Lifecycle(lifecycle) => {
                tracker.begin(id);
                self.handle_lifecycle(lifecycle, &event).await;
                self.on_complete_id(tracker, id).await;
            }
        }
    }

    /// Hand work to the channel's worker, creating it on first use.
    async fn dispatch(
        &self,
        event: &PlatformEvent,
        item: WorkItem,
        tracker: &mut CursorTracker,
        workers: &mut HashMap<String, mpsc::Sender<WorkItem>>,
        join_set: &mut JoinSet<()>,
        done_tx: &mpsc::UnboundedSender<i64>,
    ) {
        let id = item.id;
        let Some(channel) = event.channel_ref() else {
            warn!(agent = %self.ctx.agent, id, kind = %event.kind, "event without channel, skipping");
            self.finish_inline(tracker, id).await;
            return;
        };

        tracker.begin(id);

        let sender = workers.entry(channel.id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.ctx.worker_queue);
            let ctx = Arc::clone(&self.ctx);
            let done_tx = done_tx.clone();
            let channel = channel.clone();
            join_set.spawn(channel_worker(ctx, channel, rx, done_tx));
            tx
        });

        if sender.send(item).await.is_err() {
            error!(agent = %self.ctx.agent, channel = %channel.id, "channel worker gone, skipping event");
            self.on_complete_id(tracker, id).await;
        }
    }

    async fn handle_lifecycle(&self, lifecycle: LifecycleEvent, event: &PlatformEvent) {
        let ctx = &self.ctx;
        match lifecycle {
            LifecycleEvent::SubAgentCreated(payload) => {
                let Some(channel) = event.channel_ref() else {
                    warn!(agent = %ctx.agent, sub_agent = %payload.sub_agent_id, "sub-agent created without channel");
                    return;
                };
                if let Err(e) = ctx.sub_agents.on_created(&channel, &payload).await {
                    error!(
                        agent = %ctx.agent,
                        sub_agent = %payload.sub_agent_id,
                        error = %e,
                        "sub-agent bootstrap failed"
                    );
                }
            }
            LifecycleEvent::SubAgentTerminated { sub_agent_id } => {
                if let Err(e) = ctx.sub_agents.on_terminated(&sub_agent_id).await {
                    warn!(agent = %ctx.agent, sub_agent = %sub_agent_id, error = %e, "sub-agent teardown failed");
                }
            }
            LifecycleEvent::SessionRevoked => {
                warn!(agent = %ctx.agent, "upstream revoked this agent's session, stopping listener");
                let _ = ctx.stop_tx.send(true);
            }
            LifecycleEvent::Unassigned => {
                if let Some(channel) = event.channel_ref()
                    && let Some(mapping) = ctx.mapper.mapping_for_channel(&channel.id)
                {
                    info!(agent = %ctx.agent, channel = %channel.id, "agent unassigned, tearing down session");
                    ctx.mapper.destroy(&mapping.session_key).await;
                }
            }
            LifecycleEvent::Other => {
                debug!(agent = %ctx.agent, kind = %event.kind, "informational platform event");
            }
        }
    }

    /// Begin-and-complete for events handled (or discarded) inline.
    async fn finish_inline(&self, tracker: &mut CursorTracker, id: i64) {
        tracker.begin(id);
        self.on_complete_id(tracker, id).await;
    }

    async fn on_complete_id(&self, tracker: &mut CursorTracker, id: i64) {
        self.on_complete(tracker, id).await;
    }

    /// Record completion; when the watermark advances, publish it for
    /// resume and persist it. A failed write is tolerated: the
    /// in-memory position stays authoritative and the next advance
    /// retries.
    async fn on_complete(&self, tracker: &mut CursorTracker, id: i64) {
        let ctx = &self.ctx;
        if let Some(watermark) = tracker.complete(id) {
            ctx.resume.store(watermark, Ordering::Release);
            if let Err(e) = ctx.store.commit_cursor(&ctx.agent, &ctx.org, watermark).await {
                warn!(agent = %ctx.agent, watermark, error = %e, "cursor persist failed, continuing on in-memory state");
            }
        }
    }
}

async fn channel_worker(
    ctx: Arc<RouterContext>,
    channel: ChannelRef,
    mut rx: mpsc::Receiver<WorkItem>,
    done_tx: mpsc::UnboundedSender<i64>,
) {
    debug!(agent = %ctx.agent, channel = %channel.id, "channel worker started");
    let mut consecutive_unavailable = 0u32;

    while let Some(WorkItem { id, kind }) = rx.recv().await {
        let started = Instant::now();
        let completed = process_item(&ctx, &channel, kind, &mut consecutive_unavailable).await;
        ctx.metrics
            .dispatch_seconds
            .observe(started.elapsed().as_secs_f64());

        // An uncompleted item keeps the cursor below its id, so it is
        // reprocessed after a restart instead of being lost.
        if completed {
            let _ = done_tx.send(id);
        }
    }

    debug!(agent = %ctx.agent, channel = %channel.id, "channel worker stopped");
}

async fn process_item(
    ctx: &RouterContext,
    channel: &ChannelRef,
    kind: WorkKind,
    consecutive_unavailable: &mut u32,
) -> bool {
    let key = session_key(&ctx.agent, channel);

    // Terminated sub-agent sessions refuse relay outright.
    if let Err(e) = ctx.sub_agents.ensure_active(&key) {
        warn!(agent = %ctx.agent, channel = %channel.id, error = %e, "rejecting relay to terminated session");
        return true;
    }

    match kind {
        WorkKind::Chat(payload, ts) => {
            // Command marker wins over chat, always.
            if ctx.commands.is_command(&payload.content) {
                let mapping = match ctx.mapper.resolve(channel).await {
                    Ok(mapping) => mapping,
                    Err(e) => {
                        error!(agent = %ctx.agent, channel = %channel.id, error = %e, "session resolution failed for command");
                        return true;
                    }
                };
                let token = ctx.sub_agents.token_for_channel(&channel.id);
                if let Err(e) = ctx
                    .commands
                    .dispatch_content(&mapping.session_key, channel, &payload.content, token)
                    .await
                {
                    // Already reported into the channel by the router.
                    warn!(agent = %ctx.agent, channel = %channel.id, error = %e, "command dispatch failed");
                }
                return true;
            }

            let mapping = loop {
                match ctx.mapper.resolve(channel).await {
                    Ok(mapping) => break mapping,
                    Err(e) if e.is_unavailable() => {
                        if !note_unavailable(ctx, consecutive_unavailable).await {
                            return false;
                        }
                    }
                    Err(e) => {
                        error!(agent = %ctx.agent, channel = %channel.id, error = %e, "session resolution failed, dropping event");
                        return true;
                    }
                }
            };

            let message = MessageRelay::translate_inbound(&ctx.agent, channel, &payload, ts);
            loop {
                match ctx.relay.deliver_inbound(&mapping.session_key, &message).await {
                    Ok(()) => {
                        *consecutive_unavailable = 0;
                        return true;
                    }
                    Err(e) if e.is_unavailable() => {
                        if !note_unavailable(ctx, consecutive_unavailable).await {
                            return false;
                        }
                    }
                    Err(e) => {
                        error!(agent = %ctx.agent, channel = %channel.id, error = %e, "injection rejected, dropping event");
                        return true;
                    }
                }
            }
        }
        WorkKind::Command(payload) => {
            let mapping = match ctx.mapper.resolve(channel).await {
                Ok(mapping) => mapping,
                Err(e) => {
                    error!(agent = %ctx.agent, channel = %channel.id, error = %e, "session resolution failed for command");
                    return true;
                }
            };
            let token = ctx.sub_agents.token_for_channel(&channel.id);
            if let Err(e) = ctx
                .commands
                .dispatch_invoked(&mapping.session_key, channel, &payload, token)
                .await
            {
                warn!(agent = %ctx.agent, channel = %channel.id, error = %e, "command dispatch failed");
            }
            true
        }
    }
}

/// Bookkeeping for a runtime-unreachable failure. Returns `false` when
/// the bridge is shutting down and the caller should give up without
/// completing the event.
async fn note_unavailable(ctx: &RouterContext, consecutive: &mut u32) -> bool {
    *consecutive += 1;

    if *consecutive == ctx.unavailable_alert_threshold {
        error!(
            agent = %ctx.agent,
            failures = *consecutive,
            "agent runtime unreachable, sustained failure"
        );
        if let Some(fallback) = &ctx.fallback {
            ctx.relay
                .enqueue(OutboundItem::new(
                    fallback.clone(),
                    format!(
                        "Agent runtime unreachable; inbound events for {} are buffered.",
                        ctx.agent
                    ),
                    MessageKind::Notice,
                ))
                .await;
        }
    }

    let mut shutdown = ctx.shutdown.clone();
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = shutdown.changed() => !*shutdown.borrow(),
        _ = tokio::time::sleep(ctx.runtime_retry_delay) => true,
    }
}
