//! Per-room chat ring.
//!
//! Chat is plain fanout: messages are stamped by the hub, pushed onto a
//! bounded list under `chat:{room}`, and delivered to every session in the
//! room including the sender (who sees the authoritative copy). History
//! reads return the tail of the ring.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ephemeral::{chat_key, EphemeralError, EphemeralStore};

/// A chat message as stamped by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
}

/// Number of history entries returned to a requesting session.
pub const HISTORY_LIMIT: usize = 50;

/// Bounded chat ring over the ephemeral store.
pub struct ChatLog {
    store: Arc<dyn EphemeralStore>,
    ring: usize,
    ttl: Duration,
}

impl ChatLog {
    pub fn new(store: Arc<dyn EphemeralStore>, ring: usize, ttl: Duration) -> Self {
        Self { store, ring, ttl }
    }

    /// Append a stamped message, trimming the ring and refreshing its TTL.
    pub async fn push(&self, room_id: Uuid, entry: &ChatEntry) -> Result<(), EphemeralError> {
        let key = chat_key(room_id);
        let value = serde_json::to_string(entry)
            .map_err(|e| EphemeralError::Serialization(e.to_string()))?;
        self.store.right_push(&key, value).await?;
        self.store.trim(&key, -(self.ring as i64), -1).await?;
        self.store.expire(&key, self.ttl).await?;
        Ok(())
    }

    /// The most recent `limit` entries in hub-stamp order (oldest first).
    pub async fn history(
        &self,
        room_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatEntry>, EphemeralError> {
        let raw = self
            .store
            .range(&chat_key(room_id), -(limit as i64), -1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|v| serde_json::from_str(v).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeral::MemoryEphemeralStore;

    fn entry(n: u32) -> ChatEntry {
        ChatEntry {
            id: Uuid::new_v4(),
            user_id: Uuid::from_u128(1),
            username: "alice".to_string(),
            message: format!("message {n}"),
            timestamp: Utc::now(),
            code_snippet: None,
        }
    }

    fn chat_with(ring: usize) -> ChatLog {
        ChatLog::new(
            Arc::new(MemoryEphemeralStore::new()),
            ring,
            Duration::from_secs(86_400),
        )
    }

    #[tokio::test]
    async fn test_push_and_history_in_order() {
        let chat = chat_with(100);
        let room = Uuid::new_v4();
        for n in 0..3 {
            chat.push(room, &entry(n)).await.unwrap();
        }
        let history = chat.history(room, HISTORY_LIMIT).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "message 0");
        assert_eq!(history[2].message, "message 2");
    }

    #[tokio::test]
    async fn test_ring_bounded() {
        let chat = chat_with(5);
        let room = Uuid::new_v4();
        for n in 0..12 {
            chat.push(room, &entry(n)).await.unwrap();
        }
        let history = chat.history(room, 100).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].message, "message 7");
        assert_eq!(history[4].message, "message 11");
    }

    #[tokio::test]
    async fn test_history_limit_returns_tail() {
        let chat = chat_with(100);
        let room = Uuid::new_v4();
        for n in 0..60 {
            chat.push(room, &entry(n)).await.unwrap();
        }
        let history = chat.history(room, HISTORY_LIMIT).await.unwrap();
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].message, "message 10");
        assert_eq!(history[49].message, "message 59");
    }

    #[tokio::test]
    async fn test_rooms_isolated() {
        let chat = chat_with(100);
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        chat.push(room_a, &entry(1)).await.unwrap();
        assert!(chat.history(room_b, HISTORY_LIMIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snippet_roundtrip() {
        let chat = chat_with(100);
        let room = Uuid::new_v4();
        let mut with_snippet = entry(1);
        with_snippet.code_snippet = Some("fn main() {}".to_string());
        chat.push(room, &with_snippet).await.unwrap();

        let history = chat.history(room, HISTORY_LIMIT).await.unwrap();
        assert_eq!(
            history[0].code_snippet.as_deref(),
            Some("fn main() {}")
        );
    }
}
