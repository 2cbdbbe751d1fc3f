//! Wire types for the platform's line-delimited event protocol.
//!
//! Events arrive as one JSON object per line over a streaming HTTP GET.
//! Each event carries a per-stream monotonically increasing `id`;
//! keep-alive `ping` lines carry no `id` and no payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel kinds the platform exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// A persistent, named channel.
    Channel,
    /// An ephemeral task thread (one per kanban card).
    Task,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Channel => "channel",
            ChannelKind::Task => "task",
        }
    }
}

/// Fully-qualified reference to an org-scoped channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub org: String,
    pub id: String,
    pub kind: ChannelKind,
}

/// The channel portion of an event, scoped by the event's `org`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelDescriptor {
    pub id: String,
    pub kind: ChannelKind,
}

/// A single event from the stream or the poll endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformEvent {
    /// Monotonically increasing per org-scoped stream. Absent on keep-alives.
    #[serde(default)]
    pub id: Option<i64>,
    /// Event type, e.g. `message.created`, `sub_agent.terminated`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub org: Option<String>,
    /// Identity that caused the event.
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub channel: Option<ChannelDescriptor>,
    /// Type-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
}

/// Payload of a `message.created` event.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    pub message_id: String,
    pub sender: String,
    #[serde(default)]
    pub sender_display: Option<String>,
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<String>,
}

/// Payload of a `command.invoked` event (pre-parsed by the platform).
#[derive(Debug, Clone, Deserialize)]
pub struct CommandPayload {
    pub sender: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Payload of a `sub_agent.created` event.
#[derive(Debug, Clone, Deserialize)]
pub struct SubAgentCreated {
    pub sub_agent_id: String,
    /// Reference to the credential issued for this sub-agent; resolved
    /// through the configured credential provider, never a raw value.
    pub credential_ref: String,
    #[serde(default)]
    pub task_description: String,
    /// Lifetime in seconds; the upstream also enforces this and emits a
    /// termination event at expiry.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Lifecycle events the router cares about.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    SubAgentCreated(SubAgentCreated),
    SubAgentTerminated { sub_agent_id: String },
    /// Upstream signal to stop this agent's connection immediately.
    SessionRevoked,
    /// The agent was unassigned from the channel; its session is torn down.
    Unassigned,
    /// Remaining `project.*` / `task.*` traffic; logged only.
    Other,
}

/// Classification of an event for dispatch.
#[derive(Debug, Clone)]
pub enum EventClass {
    Message(MessagePayload),
    Command(CommandPayload),
    Lifecycle(LifecycleEvent),
    KeepAlive,
}

impl PlatformEvent {
    /// Whether this line is a keep-alive (no id, no payload).
    pub fn is_keep_alive(&self) -> bool {
        self.kind == "ping"
    }

    /// Classify the event for routing.
    ///
    /// Fails only when a recognized event type carries a malformed
    /// payload; unrecognized `project.*` / `task.*` types classify as
    /// informational lifecycle events.
    pub fn classify(&self) -> Result<EventClass, serde_json::Error> {
        match self.kind.as_str() {
            "ping" => Ok(EventClass::KeepAlive),
            "message.created" => {
                let payload: MessagePayload = serde_json::from_value(self.data.clone())?;
                Ok(EventClass::Message(payload))
            }
            "command.invoked" => {
                let payload: CommandPayload = serde_json::from_value(self.data.clone())?;
                Ok(EventClass::Command(payload))
            }
            "sub_agent.created" => {
                let payload: SubAgentCreated = serde_json::from_value(self.data.clone())?;
                Ok(EventClass::Lifecycle(LifecycleEvent::SubAgentCreated(
                    payload,
                )))
            }
            "sub_agent.terminated" => {
                #[derive(Deserialize)]
                struct Terminated {
                    sub_agent_id: String,
                }
                let payload: Terminated = serde_json::from_value(self.data.clone())?;
                Ok(EventClass::Lifecycle(LifecycleEvent::SubAgentTerminated {
                    sub_agent_id: payload.sub_agent_id,
                }))
            }
            "session.revoked" => Ok(EventClass::Lifecycle(LifecycleEvent::SessionRevoked)),
            "task.unassigned" | "project.unassigned" => {
                Ok(EventClass::Lifecycle(LifecycleEvent::Unassigned))
            }
            _ => Ok(EventClass::Lifecycle(LifecycleEvent::Other)),
        }
    }

    /// Resolve the event's channel against its org, if both are present.
    pub fn channel_ref(&self) -> Option<ChannelRef> {
        let org = self.org.as_ref()?;
        let channel = self.channel.as_ref()?;
        Some(ChannelRef {
            org: org.clone(),
            id: channel.id.clone(),
            kind: channel.kind,
        })
    }
}
