//! Deterministic mapping between platform channels and runtime sessions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use tether_platform::{ChannelRef, PlatformClient};
use tether_store::{SessionRecord, StateStore};

use crate::runtime::{AgentRuntime, HistoryLine, SessionSeed};
use crate::RuntimeError;

/// Derive the session key for an (agent, channel) pair.
///
/// A pure function of its inputs: recomputing it for the same channel
/// always yields the same key, so mappings are idempotent to recreate.
pub fn session_key(agent: &str, channel: &ChannelRef) -> String {
    format!(
        "{}/{}/{}/{}",
        agent,
        channel.org,
        channel.kind.as_str(),
        channel.id
    )
}

/// An established channel-to-session mapping.
#[derive(Debug, Clone)]
pub struct SessionMapping {
    pub session_key: String,
    pub agent: String,
    pub channel: ChannelRef,
    pub created_at: DateTime<Utc>,
}

/// Resolves channels to runtime sessions for one agent, creating and
/// priming sessions lazily on first use.
pub struct SessionMapper {
    agent: String,
    client: Arc<PlatformClient>,
    runtime: Arc<dyn AgentRuntime>,
    store: Arc<StateStore>,
    /// Channel id -> mapping; the session_key string is the only link
    /// back to the runtime side (no object back-references).
    sessions: DashMap<String, SessionMapping>,
    history_depth: u32,
}

impl SessionMapper {
    pub fn new(
        agent: impl Into<String>,
        client: Arc<PlatformClient>,
        runtime: Arc<dyn AgentRuntime>,
        store: Arc<StateStore>,
        history_depth: u32,
    ) -> Self {
        Self {
            agent: agent.into(),
            client,
            runtime,
            store,
            sessions: DashMap::new(),
            history_depth,
        }
    }

    /// Load mappings persisted by a previous run so existing sessions
    /// are reused instead of re-primed.
    pub async fn load_persisted(&self) -> Result<usize, RuntimeError> {
        let records = self.store.mappings_for_agent(&self.agent).await?;
        let count = records.len();
        for record in records {
            if let Some(mapping) = Self::mapping_from_record(&record) {
                self.sessions.insert(record.channel_id.clone(), mapping);
            } else {
                warn!(
                    agent = %self.agent,
                    channel = %record.channel_id,
                    kind = %record.channel_kind,
                    "skipping persisted mapping with unknown channel kind"
                );
            }
        }
        Ok(count)
    }

    fn mapping_from_record(record: &SessionRecord) -> Option<SessionMapping> {
        let kind = match record.channel_kind.as_str() {
            "channel" => tether_platform::ChannelKind::Channel,
            "task" => tether_platform::ChannelKind::Task,
            _ => return None,
        };
        Some(SessionMapping {
            session_key: record.session_key.clone(),
            agent: record.agent.clone(),
            channel: ChannelRef {
                org: record.org.clone(),
                id: record.channel_id.clone(),
                kind,
            },
            created_at: record.created_at,
        })
    }

    /// Return the existing mapping for a channel, or create one.
    ///
    /// Creation fetches a bounded window of recent history and primes
    /// the runtime session with it before the triggering event is
    /// delivered, so the agent has conversational continuity.
    pub async fn resolve(&self, channel: &ChannelRef) -> Result<SessionMapping, RuntimeError> {
        if let Some(existing) = self.sessions.get(&channel.id) {
            return Ok(existing.clone());
        }

        let history = self
            .client
            .fetch_history(channel, self.history_depth)
            .await?;
        let seed = SessionSeed {
            title: None,
            history: history
                .into_iter()
                .map(|m| HistoryLine {
                    sender: m.sender_display.unwrap_or(m.sender),
                    content: m.content,
                    at: m.created_at,
                })
                .collect(),
        };

        self.create(channel, seed).await
    }

    /// Create a mapping for an ephemeral task session, primed with the
    /// task description instead of channel history.
    pub async fn create_for_task(
        &self,
        channel: &ChannelRef,
        description: &str,
    ) -> Result<SessionMapping, RuntimeError> {
        if let Some(existing) = self.sessions.get(&channel.id) {
            return Ok(existing.clone());
        }

        let seed = SessionSeed {
            title: Some(description.to_string()),
            history: Vec::new(),
        };
        self.create(channel, seed).await
    }

    async fn create(
        &self,
        channel: &ChannelRef,
        seed: SessionSeed,
    ) -> Result<SessionMapping, RuntimeError> {
        let key = session_key(&self.agent, channel);
        self.runtime.create_session(&key, &seed).await?;

        let mapping = SessionMapping {
            session_key: key.clone(),
            agent: self.agent.clone(),
            channel: channel.clone(),
            created_at: Utc::now(),
        };

        let record = SessionRecord {
            session_key: key.clone(),
            agent: self.agent.clone(),
            org: channel.org.clone(),
            channel_id: channel.id.clone(),
            channel_kind: channel.kind.as_str().to_string(),
            created_at: mapping.created_at,
        };
        // A failed write is tolerated: the in-memory mapping stays
        // authoritative and the key is recomputable after a restart.
        if let Err(e) = self.store.upsert_mapping(&record).await {
            warn!(agent = %self.agent, error = %e, "failed to persist session mapping");
        }

        self.sessions.insert(channel.id.clone(), mapping.clone());
        info!(
            agent = %self.agent,
            channel = %channel.id,
            session = %key,
            "created session mapping"
        );
        Ok(mapping)
    }

    /// Look up the mapping for a channel without creating one.
    pub fn mapping_for_channel(&self, channel_id: &str) -> Option<SessionMapping> {
        self.sessions.get(channel_id).map(|m| m.clone())
    }

    /// Look up a mapping by its session key without creating one.
    pub fn mapping_for_session(&self, session_key: &str) -> Option<SessionMapping> {
        self.sessions
            .iter()
            .find(|entry| entry.value().session_key == session_key)
            .map(|entry| entry.value().clone())
    }

    /// Tear down a mapping. Idempotent: destroying an absent key is a
    /// no-op, and runtime/store failures are logged, not surfaced.
    pub async fn destroy(&self, session_key: &str) {
        let channel_id = self
            .sessions
            .iter()
            .find(|entry| entry.value().session_key == session_key)
            .map(|entry| entry.key().clone());

        match channel_id {
            Some(id) => {
                self.sessions.remove(&id);
                debug!(agent = %self.agent, session = %session_key, "destroyed session mapping");
            }
            None => {
                debug!(agent = %self.agent, session = %session_key, "destroy of absent mapping");
            }
        }

        if let Err(e) = self.runtime.destroy_session(session_key).await {
            warn!(agent = %self.agent, session = %session_key, error = %e, "runtime session teardown failed");
        }
        if let Err(e) = self.store.delete_mapping(session_key).await {
            warn!(agent = %self.agent, session = %session_key, error = %e, "failed to delete persisted mapping");
        }
    }

    /// Number of live mappings.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }
}
