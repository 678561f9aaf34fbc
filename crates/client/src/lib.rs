//! `cm-client` — Multi-connection chat client core.
//!
//! Manages several independent, long-lived WebSocket connections from one
//! process to distinct chat servers, merges everything they receive into a
//! single ordered, duplicate-free timeline, and keeps each connection
//! alive across transient failures with automatic reconnection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Your app (TUI / service / test harness)                 │
//! │                                                          │
//! │   let sup = SupervisorBuilder::new()                     │
//! │       .room("general")                                   │
//! │       .build()?;                                         │
//! │   sup.start(["alice", "bob", "carol"])?;                 │
//! │                                                          │
//! │   sup.send_message("alice", "hi")?;                      │
//! │   let timeline = sup.messages();                         │
//! │   let statuses = sup.statuses();                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection lifecycle (per named connection)
//!
//! 1. Connect WS to `pool[position % pool_len]` with `token=user:<name>`
//! 2. Send `join { room }`, record a "connected" system message
//! 3. Read loop: `chat` frames go through the shared deduplicator into the
//!    merged log; unknown/malformed frames surface as system messages
//! 4. On abnormal close / error / failed connect: schedule exactly one
//!    reconnect task (2000 / 3000 / 5000 ms), replacing any pending one
//! 5. On normal close or local teardown: send `leave`, close, stay closed
//!
//! Every connection recovers independently; failures never cross
//! connection boundaries.

pub mod builder;
pub mod log;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod types;

mod worker;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::SupervisorBuilder;
pub use log::{dedup_key, MessageLog};
pub use scheduler::{ReconnectPolicy, ReconnectScheduler};
pub use supervisor::ChatSupervisor;
pub use types::{ClientError, ConnectionStatus, Endpoint, Message, MessageKind};

// Re-export the wire types so callers never need cm-protocol directly.
pub use cm_protocol::{
    decode, decode_with, ChatBody, ChatFrame, ChatTypes, ClientFrame, DecodeError, ServerFrame,
};
