//! Platform-side plumbing for the Tether bridge.
//!
//! This crate owns everything that touches the collaboration platform:
//! the HTTP API client, the persistent event stream listener, the wire
//! event types, and credential resolution for agent identities.

pub mod client;
pub mod events;
pub mod secrets;
pub mod stream;

mod error;

pub use client::{ChannelMessage, EventStream, MessageKind, PlatformClient, PostedMessage};
pub use error::PlatformError;
pub use events::{
    ChannelKind, ChannelRef, CommandPayload, EventClass, LifecycleEvent, MessagePayload,
    PlatformEvent, SubAgentCreated,
};
pub use secrets::{CredentialProvider, EnvProvider, FileProvider, Secret, SecretError, VaultProvider};
pub use stream::{ConnectionState, ReconnectPolicy, StreamConfig, StreamListener};
