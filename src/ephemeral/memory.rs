//! In-memory ephemeral store.
//!
//! Single-process twin of the Redis backend: one map guarded by an async
//! RwLock, entries expired lazily on access. Suitable for tests and
//! single-node deployments.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EphemeralError, EphemeralStore};

enum Value {
    Scalar(String),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    /// None = no TTL set yet (lists before the first `expire`).
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

/// In-memory expiring KV + lists.
#[derive(Default)]
pub struct MemoryEphemeralStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Called opportunistically from writes.
    async fn sweep(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.live());
    }
}

/// Normalize a Redis-style index (negative = from tail) into `[0, len]`.
fn normalize(index: i64, len: usize) -> usize {
    if index < 0 {
        len.saturating_sub(index.unsigned_abs() as usize)
    } else {
        (index as usize).min(len)
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EphemeralError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(e) if e.live() => match &e.value {
                Value::Scalar(s) => Ok(Some(s.clone())),
                Value::List(_) => Err(EphemeralError::Backend(format!(
                    "wrong type: {key} holds a list"
                ))),
            },
            _ => Ok(None),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), EphemeralError> {
        self.sweep().await;
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, EphemeralError> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).map(|e| e.live()).unwrap_or(false))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, EphemeralError> {
        let entries = self.entries.read().await;
        let mut values = Vec::new();
        for (key, entry) in entries.iter() {
            if key.starts_with(prefix) && entry.live() {
                if let Value::Scalar(s) = &entry.value {
                    values.push(s.clone());
                }
            }
        }
        Ok(values)
    }

    async fn right_push(&self, key: &str, value: String) -> Result<u64, EphemeralError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        if !entry.live() {
            entry.value = Value::List(VecDeque::new());
            entry.expires_at = None;
        }
        match &mut entry.value {
            Value::List(list) => {
                list.push_back(value);
                Ok(list.len() as u64)
            }
            Value::Scalar(_) => Err(EphemeralError::Backend(format!(
                "wrong type: {key} holds a scalar"
            ))),
        }
    }

    async fn trim(&self, key: &str, start: i64, stop: i64) -> Result<(), EphemeralError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(());
        };
        if !entry.live() {
            entries.remove(key);
            return Ok(());
        }
        if let Value::List(list) = &mut entry.value {
            let len = list.len();
            let from = normalize(start, len);
            // Stop is inclusive.
            let to = match stop {
                s if s < 0 => len.saturating_sub(s.unsigned_abs() as usize - 1),
                s => ((s as usize) + 1).min(len),
            };
            if from >= to {
                entries.remove(key);
            } else {
                list.drain(to..);
                list.drain(..from);
            }
        }
        Ok(())
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, EphemeralError> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(key) else {
            return Ok(Vec::new());
        };
        if !entry.live() {
            return Ok(Vec::new());
        }
        match &entry.value {
            Value::List(list) => {
                let len = list.len();
                let from = normalize(start, len);
                let to = match stop {
                    s if s < 0 => len.saturating_sub(s.unsigned_abs() as usize - 1),
                    s => ((s as usize) + 1).min(len),
                };
                if from >= to {
                    return Ok(Vec::new());
                }
                Ok(list.iter().skip(from).take(to - from).cloned().collect())
            }
            Value::Scalar(_) => Err(EphemeralError::Backend(format!(
                "wrong type: {key} holds a scalar"
            ))),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EphemeralError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(e) if e.live() => {
                e.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryEphemeralStore::new();
        store
            .set_with_ttl("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryEphemeralStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryEphemeralStore::new();
        store
            .set_with_ttl("k", "v".into(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryEphemeralStore::new();
        store
            .set_with_ttl("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryEphemeralStore::new();
        store
            .set_with_ttl("presence:r1:a", "alice".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_with_ttl("presence:r1:b", "bob".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_with_ttl("presence:r2:c", "carol".into(), Duration::from_secs(60))
            .await
            .unwrap();

        let mut values = store.list_by_prefix("presence:r1:").await.unwrap();
        values.sort();
        assert_eq!(values, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_push_range() {
        let store = MemoryEphemeralStore::new();
        for i in 0..5 {
            let len = store.right_push("list", format!("v{i}")).await.unwrap();
            assert_eq!(len, i + 1);
        }
        let all = store.range("list", 0, -1).await.unwrap();
        assert_eq!(all, vec!["v0", "v1", "v2", "v3", "v4"]);

        let tail = store.range("list", -2, -1).await.unwrap();
        assert_eq!(tail, vec!["v3", "v4"]);
    }

    #[tokio::test]
    async fn test_trim_keeps_tail_window() {
        let store = MemoryEphemeralStore::new();
        for i in 0..10 {
            store.right_push("list", format!("v{i}")).await.unwrap();
        }
        store.trim("list", -3, -1).await.unwrap();
        let all = store.range("list", 0, -1).await.unwrap();
        assert_eq!(all, vec!["v7", "v8", "v9"]);
    }

    #[tokio::test]
    async fn test_trim_drop_last_element() {
        let store = MemoryEphemeralStore::new();
        for i in 0..3 {
            store.right_push("list", format!("v{i}")).await.unwrap();
        }
        // Keep everything but the tail entry.
        store.trim("list", 0, -2).await.unwrap();
        let all = store.range("list", 0, -1).await.unwrap();
        assert_eq!(all, vec!["v0", "v1"]);
    }

    #[tokio::test]
    async fn test_trim_empty_window_removes_key() {
        let store = MemoryEphemeralStore::new();
        store.right_push("list", "v".into()).await.unwrap();
        store.trim("list", 5, 3).await.unwrap();
        assert!(store.range("list", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_list() {
        let store = MemoryEphemeralStore::new();
        store.right_push("list", "v".into()).await.unwrap();
        assert!(store.expire("list", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.range("list", 0, -1).await.unwrap().is_empty());
        assert!(!store.expire("list", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_errors() {
        let store = MemoryEphemeralStore::new();
        store
            .set_with_ttl("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.right_push("k", "x".into()).await.is_err());

        store.right_push("list", "x".into()).await.unwrap();
        assert!(store.get("list").await.is_err());
    }

    #[tokio::test]
    async fn test_backend_name() {
        assert_eq!(MemoryEphemeralStore::new().backend_name(), "memory");
    }
}
