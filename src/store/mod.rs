//! Durable document store.
//!
//! The hub consumes this narrow contract; everything relational (pooling,
//! schema, migrations) stays behind it. Writes on the edit path are retried
//! with exponential backoff before an error is surfaced to the session.

pub mod memory;
pub mod postgres;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// A file row. `content` is the canonical document state; all edits funnel
/// through the single hub owning the file's room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: Uuid,
    pub room_id: Uuid,
    pub name: String,
    pub content: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only snapshot of a file's content before a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: Uuid,
    pub file_id: Uuid,
    pub content: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A room row. Rooms are created and deleted by the REST facade; the core
/// only checks membership and cascades on deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub invite_code: String,
}

/// Number of versions surfaced to readers.
pub const VERSION_RING: i64 = 50;

/// Store failures.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Row does not exist.
    NotFound,
    /// Unique constraint or concurrent conflicting write.
    Conflict,
    /// Timeout or connection failure; safe to retry.
    Transient(String),
    /// Anything else (schema drift, serialization).
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "not found"),
            StoreError::Conflict => write!(f, "conflict"),
            StoreError::Transient(e) => write!(f, "transient store error: {e}"),
            StoreError::Fatal(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The contract the hub consumes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_file(&self, file_id: Uuid) -> Result<File, StoreError>;

    /// Update `content` and `updated_at` atomically.
    async fn save_content(&self, file_id: Uuid, content: &str) -> Result<(), StoreError>;

    /// Record the pre-save content. Idempotent on retry: a duplicate row
    /// for the same `(file, second)` is silently rejected by storage.
    async fn append_version(
        &self,
        file_id: Uuid,
        prior_content: &str,
        user_id: Uuid,
    ) -> Result<(), StoreError>;

    /// The most recent versions, newest first, capped at [`VERSION_RING`].
    async fn list_versions(&self, file_id: Uuid) -> Result<Vec<FileVersion>, StoreError>;

    async fn list_files(&self, room_id: Uuid) -> Result<Vec<File>, StoreError>;

    async fn create_file(
        &self,
        room_id: Uuid,
        name: &str,
        language: &str,
    ) -> Result<File, StoreError>;

    async fn delete_file(&self, file_id: Uuid) -> Result<(), StoreError>;

    /// Authoritative permission check: may `user_id` read/edit `room_id`?
    async fn room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;
}

/// Per-attempt timeout for store calls.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay of the 100ms/400ms/1.6s backoff schedule.
const BACKOFF_BASE_MS: u64 = 100;

/// Run a store operation with up to `attempts` tries.
///
/// Non-transient errors return immediately; transient errors and per-attempt
/// timeouts back off 100ms, 400ms, 1.6s between tries.
pub async fn with_retry<T, F, Fut>(attempts: u32, mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match tokio::time::timeout(ATTEMPT_TIMEOUT, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_transient() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => StoreError::Transient("store call timed out".to_string()),
        };
        if attempt >= attempts {
            return Err(error);
        }
        let delay = Duration::from_millis(BACKOFF_BASE_MS * 4u64.pow(attempt - 1));
        log::warn!(
            "store attempt {attempt}/{attempts} failed ({error}), retrying in {}ms",
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }
}
