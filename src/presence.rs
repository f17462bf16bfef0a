//! Presence registry and cursor-color allocation.
//!
//! Presence is the ephemeral record that a user is currently connected to a
//! room: display name, assigned cursor color, last cursor position, and the
//! session that owns the entry. Entries live in the ephemeral store under
//! `presence:{room}:{user}` with a 3600s TTL refreshed on any activity, so
//! at most one entry exists per `(room, user)` and a hub restart degrades
//! gracefully instead of corrupting anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ephemeral::{presence_key, presence_prefix, EphemeralError, EphemeralStore};

/// Last reported cursor location inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub file_id: Uuid,
    pub line: u32,
    pub column: u32,
}

/// One room participant as seen by every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub username: String,
    /// Hex cursor color from the room palette, stable for the lifetime of
    /// the entry.
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPos>,
    pub session_id: Uuid,
}

/// Fixed room palette; assignment cycles per hub instance.
pub const CURSOR_PALETTE: [&str; 8] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
];

/// Cycles through [`CURSOR_PALETTE`] for one room.
///
/// The assignment is keyed by user, not session, so a reconnecting user
/// keeps their color while their presence entry survives.
#[derive(Default)]
pub struct ColorAllocator {
    assigned: HashMap<Uuid, String>,
    next: usize,
}

impl ColorAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_for(&mut self, user_id: Uuid) -> String {
        if let Some(color) = self.assigned.get(&user_id) {
            return color.clone();
        }
        let color = CURSOR_PALETTE[self.next % CURSOR_PALETTE.len()].to_string();
        self.next += 1;
        self.assigned.insert(user_id, color.clone());
        color
    }

    pub fn release(&mut self, user_id: Uuid) {
        self.assigned.remove(&user_id);
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned.len()
    }
}

/// Per-room presence index over the ephemeral store.
pub struct PresenceRegistry {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Upsert a presence entry, refreshing its TTL.
    pub async fn put(&self, room_id: Uuid, record: &PresenceRecord) -> Result<(), EphemeralError> {
        let value = serde_json::to_string(record)
            .map_err(|e| EphemeralError::Serialization(e.to_string()))?;
        self.store
            .set_with_ttl(&presence_key(room_id, record.user_id), value, self.ttl)
            .await
    }

    /// Every live participant of a room. Entries that fail to parse are
    /// skipped; a missing entry is permissible data loss.
    pub async fn room(&self, room_id: Uuid) -> Result<Vec<PresenceRecord>, EphemeralError> {
        let raw = self.store.list_by_prefix(&presence_prefix(room_id)).await?;
        let mut records: Vec<PresenceRecord> = raw
            .iter()
            .filter_map(|v| serde_json::from_str(v).ok())
            .collect();
        records.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(records)
    }

    pub async fn drop(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, EphemeralError> {
        self.store.delete(&presence_key(room_id, user_id)).await
    }
}
