//! Durable local state for the Tether bridge.
//!
//! Session mappings, per-agent stream cursors, and sub-agent sessions
//! live in a local SQLite database so the bridge survives restarts
//! without losing or duplicating events. Writes are small atomic
//! upserts with single-writer-per-key discipline; a failed write is
//! never fatal mid-run (callers continue on in-memory state and retry
//! at the next opportunity).

mod error;
mod store;

pub use error::StoreError;
pub use store::{CursorRecord, SessionRecord, StateStore, SubAgentRecord, SubAgentStatus};
