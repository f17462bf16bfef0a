//! Ephemeral key–value store backing presence, operation logs, and chat.
//!
//! ```text
//! presence:{room}:{user} ── presence record, TTL 3600s
//! pending:{file}         ── operation window list, TTL 300s
//! chat:{room}            ── chat ring list, TTL 86400s
//! ```
//!
//! Both backends expose the same single-key atomic operations; expiry is
//! permissible data loss (missing entries skip transformation — the durable
//! store content is always current), never correctness loss.

pub mod memory;
pub mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryEphemeralStore;
pub use redis::RedisEphemeralStore;

/// Errors from the ephemeral store. All are treated as transient by
/// callers: a failed presence write degrades, it never aborts an edit.
#[derive(Debug, Clone)]
pub enum EphemeralError {
    Backend(String),
    Serialization(String),
}

impl fmt::Display for EphemeralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EphemeralError::Backend(e) => write!(f, "ephemeral backend error: {e}"),
            EphemeralError::Serialization(e) => write!(f, "ephemeral serialization error: {e}"),
        }
    }
}

impl std::error::Error for EphemeralError {}

/// Single-key atomic operations over an expiring KV store with lists.
///
/// `trim`/`range` use inclusive start/stop indices where negative values
/// count from the tail, matching the Redis LTRIM/LRANGE convention both
/// backends implement.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, EphemeralError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), EphemeralError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, EphemeralError>;

    /// Values of all live scalar keys starting with `prefix`.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, EphemeralError>;

    /// Append to the tail of a list, returning the new length.
    async fn right_push(&self, key: &str, value: String) -> Result<u64, EphemeralError>;

    /// Keep only the inclusive `[start, stop]` slice of a list.
    async fn trim(&self, key: &str, start: i64, stop: i64) -> Result<(), EphemeralError>;

    /// Read the inclusive `[start, stop]` slice of a list.
    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, EphemeralError>;

    /// Reset a key's TTL. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EphemeralError>;

    fn backend_name(&self) -> &'static str;
}

/// Presence key for a `(room, user)` pair.
pub fn presence_key(room_id: uuid::Uuid, user_id: uuid::Uuid) -> String {
    format!("presence:{room_id}:{user_id}")
}

/// Prefix matching every presence entry of a room.
pub fn presence_prefix(room_id: uuid::Uuid) -> String {
    format!("presence:{room_id}:")
}

/// Operation-window key for a file.
pub fn pending_key(file_id: uuid::Uuid) -> String {
    format!("pending:{file_id}")
}

/// Chat-ring key for a room.
pub fn chat_key(room_id: uuid::Uuid) -> String {
    format!("chat:{room_id}")
}
