//! Command detection and routing.
//!
//! Anything whose content begins with the command marker is a command,
//! never ordinary chat. Output is posted back to the originating
//! channel tagged as command output so downstream consumers render it
//! distinctly.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use tether_platform::{ChannelRef, CommandPayload, MessageKind, Secret};

use crate::relay::{MessageRelay, OutboundItem};
use crate::runtime::AgentRuntime;
use crate::RuntimeError;

/// A parsed command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

/// Split marker-prefixed content into a command name and arguments.
/// Returns `None` when the content is not a command or names no
/// command (the bare marker).
pub fn parse_command(marker: &str, content: &str) -> Option<ParsedCommand> {
    let rest = content.strip_prefix(marker)?;
    let mut parts = rest.split_whitespace();
    let name = parts.next()?.to_string();
    Some(ParsedCommand {
        name,
        args: parts.map(str::to_string).collect(),
    })
}

/// Routes command-shaped input to the runtime's command execution path.
pub struct CommandRouter {
    marker: String,
    runtime: Arc<dyn AgentRuntime>,
    relay: Arc<MessageRelay>,
    timeout: Duration,
}

impl CommandRouter {
    pub fn new(
        marker: impl Into<String>,
        runtime: Arc<dyn AgentRuntime>,
        relay: Arc<MessageRelay>,
        timeout: Duration,
    ) -> Self {
        Self {
            marker: marker.into(),
            runtime,
            relay,
            timeout,
        }
    }

    /// Whether this content must bypass the message relay.
    pub fn is_command(&self, content: &str) -> bool {
        content.starts_with(&self.marker)
    }

    /// Route marker-prefixed message content.
    pub async fn dispatch_content(
        &self,
        session_key: &str,
        channel: &ChannelRef,
        content: &str,
        token: Option<Secret>,
    ) -> Result<(), RuntimeError> {
        match parse_command(&self.marker, content) {
            Some(command) => {
                self.execute(session_key, channel, &command, token).await
            }
            None => {
                // The bare marker: answer with usage instead of chat.
                self.relay
                    .enqueue(
                        OutboundItem::new(
                            channel.clone(),
                            format!("Usage: {}<command> [args]", self.marker),
                            MessageKind::Notice,
                        )
                        .with_token(token),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Route a `command.invoked` event (already parsed upstream).
    pub async fn dispatch_invoked(
        &self,
        session_key: &str,
        channel: &ChannelRef,
        payload: &CommandPayload,
        token: Option<Secret>,
    ) -> Result<(), RuntimeError> {
        let command = ParsedCommand {
            name: payload.name.clone(),
            args: payload.args.clone(),
        };
        self.execute(session_key, channel, &command, token).await
    }

    async fn execute(
        &self,
        session_key: &str,
        channel: &ChannelRef,
        command: &ParsedCommand,
        token: Option<Secret>,
    ) -> Result<(), RuntimeError> {
        info!(
            session = %session_key,
            command = %command.name,
            args = command.args.len(),
            "executing command"
        );

        let result = tokio::time::timeout(
            self.timeout,
            self.runtime
                .execute_command(session_key, &command.name, &command.args),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                self.relay
                    .enqueue(
                        OutboundItem::new(channel.clone(), output, MessageKind::CommandOutput)
                            .with_token(token),
                    )
                    .await;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(session = %session_key, command = %command.name, error = %e, "command failed");
                self.relay
                    .enqueue(
                        OutboundItem::new(
                            channel.clone(),
                            format!("Command `{}` failed: {}", command.name, e),
                            MessageKind::Notice,
                        )
                        .with_token(token),
                    )
                    .await;
                Err(e)
            }
            Err(_) => {
                let err = RuntimeError::Timeout(format!(
                    "command `{}` exceeded {}s",
                    command.name,
                    self.timeout.as_secs()
                ));
                warn!(session = %session_key, command = %command.name, "command timed out");
                self.relay
                    .enqueue(
                        OutboundItem::new(
                            channel.clone(),
                            format!("Command `{}` timed out.", command.name),
                            MessageKind::Notice,
                        )
                        .with_token(token),
                    )
                    .await;
                Err(err)
            }
        }
    }
}
