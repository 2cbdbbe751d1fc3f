//! Bridge-core logic for Tether.
//!
//! This crate maps platform channels to runtime sessions, relays
//! messages in both directions, routes commands, and manages
//! short-lived sub-agent sessions. The agent runtime itself is an
//! external collaborator reached through the [`AgentRuntime`] contract.

pub mod command;
pub mod cursor;
pub mod relay;
pub mod runtime;
pub mod session;
pub mod subagent;
pub mod testing;

mod error;

pub use command::{CommandRouter, ParsedCommand, parse_command};
pub use cursor::CursorTracker;
pub use error::RuntimeError;
pub use relay::{DeliveryPolicy, MessageRelay, NullObserver, OutboundItem, RelayObserver, RelaySignal};
pub use runtime::{AgentRuntime, HistoryLine, HttpRuntime, InboundMessage, SessionSeed};
pub use session::{SessionMapper, SessionMapping, session_key};
pub use subagent::{SubAgentManager, SubAgentState};
