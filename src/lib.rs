//! # tandem-collab — session layer for a shared code-editor service
//!
//! Multiple authenticated users connect to a room holding one or more text
//! files; everyone edits concurrently and sees every other participant's
//! edits, cursors, and chat with low latency.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   JSON frames   ┌─────────────┐      ┌────────────┐
//! │  Session   │ ◄─────────────► │  Session    │ ───► │  RoomHub   │
//! │ (client)   │    WebSocket    │  Endpoint   │ mpsc │ (per room) │
//! └────────────┘                 └─────────────┘      └─────┬──────┘
//!                                                           │
//!                              ┌────────────┬───────────────┼─────────┐
//!                              ▼            ▼               ▼         ▼
//!                         OT engine    DocumentStore    Presence   OpLog/Chat
//!                         (pure)       (Postgres)       (ephemeral KV)
//! ```
//!
//! Every mutation for a room flows through that room's single hub task, so
//! edits are linearized per file without locks; concurrent edits are
//! reconciled by the operational-transform engine against a bounded window
//! of recent operations.
//!
//! ## Modules
//!
//! - [`ot`] — pure transform/apply/compose on edit operations
//! - [`protocol`] — JSON `{event, data}` wire frames
//! - [`hub`] — per-room serialization point, fanout, backpressure
//! - [`session`] — per-connection state machine (reader/writer tasks)
//! - [`server`] — accept loop and room registry
//! - [`store`] — durable file/version contract (Postgres or in-memory)
//! - [`ephemeral`] — expiring KV contract (Redis or in-memory)
//! - [`presence`], [`oplog`], [`chat`] — the ephemeral indices
//! - [`auth`] — bearer-token identity gate
//! - [`client`] — WebSocket client for tests and tooling

pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod hub;
pub mod oplog;
pub mod ot;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

pub use auth::{Identity, JwtVerifier, StaticVerifier, TokenVerifier};
pub use chat::{ChatEntry, ChatLog};
pub use client::{CollabClient, ConnectionState, SessionEvent};
pub use config::Config;
pub use ephemeral::{EphemeralStore, MemoryEphemeralStore, RedisEphemeralStore};
pub use error::{ErrorKind, ServiceError};
pub use hub::{HubCommand, HubHandle, SessionHandle};
pub use oplog::OperationLog;
pub use ot::Operation;
pub use presence::{ColorAllocator, CursorPos, PresenceRecord, PresenceRegistry};
pub use protocol::{ClientFrame, ServerFrame};
pub use server::{CollabServer, ServerStats};
pub use store::{DocumentStore, File, FileVersion, MemoryStore, PostgresStore};
