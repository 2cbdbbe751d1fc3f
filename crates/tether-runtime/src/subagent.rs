//! Sub-agent session lifecycle.
//!
//! Sub-agents are short-lived sessions tied to ephemeral credentials.
//! They are bootstrapped from `sub_agent.created` events, torn down on
//! `sub_agent.terminated` (explicit or upstream timeout), and refuse
//! relay once terminated instead of silently dropping.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use tether_platform::{ChannelRef, CredentialProvider, Secret, SubAgentCreated};
use tether_store::{StateStore, SubAgentRecord, SubAgentStatus};

use crate::session::SessionMapper;
use crate::RuntimeError;

/// In-memory view of one sub-agent session.
#[derive(Debug, Clone)]
pub struct SubAgentState {
    pub sub_agent_id: String,
    /// Key of the task session the sub-agent is bound to.
    pub session_key: String,
    pub channel_id: String,
    pub credential_ref: String,
    /// Resolved ephemeral credential; `None` when resolution failed
    /// after a restart (outbound then falls back to the agent token).
    pub token: Option<Secret>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: SubAgentStatus,
}

/// Bootstraps and destroys sub-agent sessions for one agent.
pub struct SubAgentManager {
    mapper: Arc<SessionMapper>,
    store: Arc<StateStore>,
    provider: Arc<dyn CredentialProvider>,
    sessions: DashMap<String, SubAgentState>,
}

impl SubAgentManager {
    pub fn new(
        mapper: Arc<SessionMapper>,
        store: Arc<StateStore>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            mapper,
            store,
            provider,
            sessions: DashMap::new(),
        }
    }

    /// Restore sub-agent sessions persisted by a previous run.
    ///
    /// Active sessions (including ones the orchestrator re-activated
    /// from `detached`) get their credentials re-resolved; terminated
    /// ones are kept so relay attempts keep being rejected.
    pub async fn load_persisted(&self) -> Result<usize, RuntimeError> {
        let mut restored = 0;
        let prefix = format!("{}/", self.mapper.agent());

        for status in [SubAgentStatus::Active, SubAgentStatus::Terminated] {
            for record in self.store.sub_agents_with_status(status).await? {
                // The store is shared across agents; session keys are
                // prefixed with the owning agent's name.
                if !record.parent_session_key.starts_with(&prefix) {
                    continue;
                }
                let token = if record.status == SubAgentStatus::Active {
                    match self.provider.resolve(&record.credential_ref).await {
                        Ok(token) => Some(token),
                        Err(e) => {
                            warn!(
                                sub_agent = %record.sub_agent_id,
                                error = %e,
                                "could not re-resolve ephemeral credential"
                            );
                            None
                        }
                    }
                } else {
                    None
                };

                let channel_id = self
                    .mapper
                    .mapping_for_session(&record.parent_session_key)
                    .map(|m| m.channel.id)
                    .unwrap_or_default();

                self.sessions.insert(
                    record.sub_agent_id.clone(),
                    SubAgentState {
                        sub_agent_id: record.sub_agent_id.clone(),
                        session_key: record.parent_session_key.clone(),
                        channel_id,
                        credential_ref: record.credential_ref.clone(),
                        token,
                        expires_at: record.expires_at,
                        status: record.status,
                    },
                );
                restored += 1;
            }
        }

        Ok(restored)
    }

    /// Handle `sub_agent.created`: resolve the ephemeral credential,
    /// bootstrap a task-kind mapping primed with the task description,
    /// and start relaying as normal.
    pub async fn on_created(
        &self,
        channel: &ChannelRef,
        payload: &SubAgentCreated,
    ) -> Result<(), RuntimeError> {
        if let Some(existing) = self.sessions.get(&payload.sub_agent_id) {
            if existing.status == SubAgentStatus::Active {
                debug!(sub_agent = %payload.sub_agent_id, "sub-agent already active");
                return Ok(());
            }
            if existing.status == SubAgentStatus::Terminated {
                return Err(RuntimeError::SessionTerminated(
                    existing.session_key.clone(),
                ));
            }
        }

        let token = self.provider.resolve(&payload.credential_ref).await?;
        let mapping = self
            .mapper
            .create_for_task(channel, &payload.task_description)
            .await?;

        let expires_at = payload
            .timeout_secs
            .map(|secs| Utc::now() + Duration::seconds(secs as i64));

        let record = SubAgentRecord {
            sub_agent_id: payload.sub_agent_id.clone(),
            parent_session_key: mapping.session_key.clone(),
            credential_ref: payload.credential_ref.clone(),
            expires_at,
            status: SubAgentStatus::Active,
        };
        if let Err(e) = self.store.upsert_sub_agent(&record).await {
            warn!(sub_agent = %payload.sub_agent_id, error = %e, "failed to persist sub-agent session");
        }

        self.sessions.insert(
            payload.sub_agent_id.clone(),
            SubAgentState {
                sub_agent_id: payload.sub_agent_id.clone(),
                session_key: mapping.session_key,
                channel_id: channel.id.clone(),
                credential_ref: payload.credential_ref.clone(),
                token: Some(token),
                expires_at,
                status: SubAgentStatus::Active,
            },
        );

        info!(
            sub_agent = %payload.sub_agent_id,
            channel = %channel.id,
            expires_at = ?expires_at,
            "sub-agent session bootstrapped"
        );
        Ok(())
    }

    /// Handle `sub_agent.terminated`: mark terminated, destroy the
    /// mapping, and refuse further relay. Idempotent.
    pub async fn on_terminated(&self, sub_agent_id: &str) -> Result<(), RuntimeError> {
        let session_key = match self.sessions.get_mut(sub_agent_id) {
            Some(mut state) => {
                if state.status == SubAgentStatus::Terminated {
                    return Ok(());
                }
                state.status = SubAgentStatus::Terminated;
                state.token = None;
                state.session_key.clone()
            }
            None => {
                debug!(sub_agent = %sub_agent_id, "termination for unknown sub-agent");
                return Ok(());
            }
        };

        if let Err(e) = self
            .store
            .set_sub_agent_status(sub_agent_id, SubAgentStatus::Terminated)
            .await
        {
            warn!(sub_agent = %sub_agent_id, error = %e, "failed to persist sub-agent termination");
        }

        self.mapper.destroy(&session_key).await;
        info!(sub_agent = %sub_agent_id, session = %session_key, "sub-agent session terminated");
        Ok(())
    }

    /// Reject relay attempts against terminated sub-agent sessions.
    pub fn ensure_active(&self, session_key: &str) -> Result<(), RuntimeError> {
        let terminated = self.sessions.iter().any(|entry| {
            entry.value().session_key == session_key
                && entry.value().status == SubAgentStatus::Terminated
        });
        if terminated {
            return Err(RuntimeError::SessionTerminated(session_key.to_string()));
        }
        Ok(())
    }

    /// Credential override for posts into a sub-agent's task channel.
    pub fn token_for_channel(&self, channel_id: &str) -> Option<Secret> {
        self.sessions.iter().find_map(|entry| {
            let state = entry.value();
            (state.channel_id == channel_id && state.status == SubAgentStatus::Active)
                .then(|| state.token.clone())
                .flatten()
        })
    }

    /// Terminate sessions whose lifetime passed without an upstream
    /// termination event. Returns the ids that were swept.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let state = entry.value();
                state.status == SubAgentStatus::Active
                    && state.expires_at.is_some_and(|at| at <= now)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for sub_agent_id in &expired {
            warn!(sub_agent = %sub_agent_id, "sub-agent expired without termination event");
            if let Err(e) = self.on_terminated(sub_agent_id).await {
                warn!(sub_agent = %sub_agent_id, error = %e, "expiry sweep failed");
            }
        }
        expired
    }

    /// Number of active sub-agent sessions.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().status == SubAgentStatus::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRuntime, StaticProvider};
    use pretty_assertions::assert_eq;
    use tether_platform::{ChannelKind, PlatformClient};
    use wiremock::MockServer;

    fn task_channel(id: &str) -> ChannelRef {
        ChannelRef {
            org: "acme".into(),
            id: id.into(),
            kind: ChannelKind::Task,
        }
    }

    fn created(id: &str, timeout_secs: Option<u64>) -> SubAgentCreated {
        SubAgentCreated {
            sub_agent_id: id.into(),
            credential_ref: "SUB_TOKEN".into(),
            task_description: "Triage flaky tests".into(),
            timeout_secs,
        }
    }

    async fn manager(server: &MockServer) -> (SubAgentManager, Arc<MockRuntime>, Arc<SessionMapper>) {
        let client = Arc::new(
            PlatformClient::new(server.uri(), Secret::new("tok_agent"), true).unwrap(),
        );
        let runtime = Arc::new(MockRuntime::default());
        let store = Arc::new(StateStore::open_in_memory().await.unwrap());
        let mapper = Arc::new(SessionMapper::new(
            "marvin",
            client,
            runtime.clone(),
            store.clone(),
            50,
        ));
        let provider = Arc::new(StaticProvider::default().with("SUB_TOKEN", "tok_sub"));
        (
            SubAgentManager::new(mapper.clone(), store, provider),
            runtime,
            mapper,
        )
    }

    #[tokio::test]
    async fn created_bootstraps_a_task_session() {
        let server = MockServer::start().await;
        let (manager, runtime, mapper) = manager(&server).await;

        manager
            .on_created(&task_channel("task_77"), &created("sub_1", Some(300)))
            .await
            .unwrap();

        assert_eq!(manager.active_count(), 1);
        assert_eq!(mapper.active_count(), 1);
        assert_eq!(
            manager.token_for_channel("task_77").unwrap().expose(),
            "tok_sub"
        );

        // Primed with the task description, not channel history.
        let created_sessions = runtime.created.lock().unwrap().clone();
        assert_eq!(created_sessions.len(), 1);
        assert_eq!(
            created_sessions[0].1.title.as_deref(),
            Some("Triage flaky tests")
        );
        assert!(created_sessions[0].1.history.is_empty());
    }

    #[tokio::test]
    async fn terminated_destroys_and_rejects() {
        let server = MockServer::start().await;
        let (manager, runtime, mapper) = manager(&server).await;

        let channel = task_channel("task_77");
        manager
            .on_created(&channel, &created("sub_1", None))
            .await
            .unwrap();
        let key = mapper.mapping_for_channel("task_77").unwrap().session_key;

        manager.on_terminated("sub_1").await.unwrap();

        // Absent from the active set, mapping destroyed in the runtime.
        assert_eq!(manager.active_count(), 0);
        assert!(mapper.mapping_for_channel("task_77").is_none());
        assert!(runtime.destroyed.lock().unwrap().contains(&key));

        // Further relay attempts are refused, not silently dropped.
        let err = manager.ensure_active(&key).unwrap_err();
        assert!(matches!(err, RuntimeError::SessionTerminated(_)));

        // And the token override is gone.
        assert!(manager.token_for_channel("task_77").is_none());

        // Terminating again is idempotent.
        manager.on_terminated("sub_1").await.unwrap();
        manager.on_terminated("sub_unknown").await.unwrap();
    }

    #[tokio::test]
    async fn expiry_sweep_terminates_overdue_sessions() {
        let server = MockServer::start().await;
        let (manager, _runtime, _mapper) = manager(&server).await;

        manager
            .on_created(&task_channel("task_77"), &created("sub_1", Some(0)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let swept = manager.sweep_expired().await;
        assert_eq!(swept, vec!["sub_1".to_string()]);
        assert_eq!(manager.active_count(), 0);

        // A second sweep finds nothing.
        assert!(manager.sweep_expired().await.is_empty());
    }

    #[tokio::test]
    async fn terminated_state_survives_restart() {
        let server = MockServer::start().await;
        let client = Arc::new(
            PlatformClient::new(server.uri(), Secret::new("tok_agent"), true).unwrap(),
        );
        let store = Arc::new(StateStore::open_in_memory().await.unwrap());
        let provider = Arc::new(StaticProvider::default().with("SUB_TOKEN", "tok_sub"));

        let key = {
            let runtime = Arc::new(MockRuntime::default());
            let mapper = Arc::new(SessionMapper::new(
                "marvin",
                client.clone(),
                runtime,
                store.clone(),
                50,
            ));
            let manager = SubAgentManager::new(mapper.clone(), store.clone(), provider.clone());
            manager
                .on_created(&task_channel("task_77"), &created("sub_1", None))
                .await
                .unwrap();
            let key = mapper.mapping_for_channel("task_77").unwrap().session_key;
            manager.on_terminated("sub_1").await.unwrap();
            key
        };

        // Fresh manager over the same store (restart).
        let runtime = Arc::new(MockRuntime::default());
        let mapper = Arc::new(SessionMapper::new(
            "marvin",
            client,
            runtime,
            store.clone(),
            50,
        ));
        let manager = SubAgentManager::new(mapper, store, provider);
        assert_eq!(manager.load_persisted().await.unwrap(), 1);

        let err = manager.ensure_active(&key).unwrap_err();
        assert!(matches!(err, RuntimeError::SessionTerminated(_)));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn missing_credential_fails_creation() {
        let server = MockServer::start().await;
        let client = Arc::new(
            PlatformClient::new(server.uri(), Secret::new("tok_agent"), true).unwrap(),
        );
        let runtime = Arc::new(MockRuntime::default());
        let store = Arc::new(StateStore::open_in_memory().await.unwrap());
        let mapper = Arc::new(SessionMapper::new("marvin", client, runtime, store.clone(), 50));
        let manager = SubAgentManager::new(mapper, store, Arc::new(StaticProvider::default()));

        let err = manager
            .on_created(&task_channel("task_77"), &created("sub_1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Secret(_)));
        assert_eq!(manager.active_count(), 0);
    }
}
