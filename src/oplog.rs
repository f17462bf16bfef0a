//! Bounded per-file operation window.
//!
//! The last N transformed operations applied to a file, retained so that
//! late-arriving concurrent edits can be rewritten against everything that
//! landed since the sender last saw the document. Stored as a list under
//! `pending:{file}` with a short TTL: an expired window only means a stale
//! edit skips transformation, which is acceptable because the durable
//! content is always current.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::ephemeral::{pending_key, EphemeralError, EphemeralStore};
use crate::ot::{self, Operation};

/// Per-file operation window over the ephemeral store.
pub struct OperationLog {
    store: Arc<dyn EphemeralStore>,
    window: usize,
    ttl: Duration,
}

impl OperationLog {
    pub fn new(store: Arc<dyn EphemeralStore>, window: usize, ttl: Duration) -> Self {
        Self { store, window, ttl }
    }

    /// Append a transformed operation, compacting against the tail and
    /// trimming to the window.
    ///
    /// Compaction merges a run of keystrokes from one user (contiguous
    /// inserts, repeated deletes at one position) into a single entry so
    /// the window covers more real time.
    pub async fn push(&self, file_id: Uuid, op: &Operation) -> Result<(), EphemeralError> {
        let key = pending_key(file_id);

        let tail = self.store.range(&key, -1, -1).await?;
        let merged = tail
            .first()
            .and_then(|raw| serde_json::from_str::<Operation>(raw).ok())
            .and_then(|prev| {
                let composed = ot::compose(&[prev, op.clone()]);
                (composed.len() == 1).then(|| composed.into_iter().next().unwrap())
            });

        let entry = merged.as_ref().unwrap_or(op);
        let value = serde_json::to_string(entry)
            .map_err(|e| EphemeralError::Serialization(e.to_string()))?;

        if merged.is_some() {
            // Replace the tail entry with the merged operation.
            self.store.trim(&key, 0, -2).await?;
        }
        self.store.right_push(&key, value).await?;
        self.store
            .trim(&key, -(self.window as i64), -1)
            .await?;
        self.store.expire(&key, self.ttl).await?;
        Ok(())
    }

    /// The current window, oldest first. Unparseable entries are skipped.
    pub async fn list(&self, file_id: Uuid) -> Result<Vec<Operation>, EphemeralError> {
        let raw = self.store.range(&pending_key(file_id), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|v| serde_json::from_str(v).ok())
            .collect())
    }

    /// Drop the window (file deleted).
    pub async fn clear(&self, file_id: Uuid) -> Result<(), EphemeralError> {
        self.store.delete(&pending_key(file_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeral::MemoryEphemeralStore;
    use chrono::{TimeZone, Utc};

    fn log_with(window: usize) -> OperationLog {
        OperationLog::new(
            Arc::new(MemoryEphemeralStore::new()),
            window,
            Duration::from_secs(300),
        )
    }

    fn ts(ms: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[tokio::test]
    async fn test_push_and_list_in_order() {
        let log = log_with(100);
        let file = Uuid::new_v4();
        let a = Operation::insert(0, "a", Uuid::from_u128(1), ts(1));
        let b = Operation::delete(5, 2, Uuid::from_u128(2), ts(2));

        log.push(file, &a).await.unwrap();
        log.push(file, &b).await.unwrap();

        assert_eq!(log.list(file).await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_window_bounded() {
        let log = log_with(5);
        let file = Uuid::new_v4();
        for i in 0..20u32 {
            // Alternate users so nothing compacts.
            let op = Operation::insert(
                i as usize,
                "x",
                Uuid::from_u128((i % 2) as u128),
                ts(i as i64),
            );
            log.push(file, &op).await.unwrap();
            assert!(log.list(file).await.unwrap().len() <= 5);
        }
        let window = log.list(file).await.unwrap();
        assert_eq!(window.len(), 5);
        assert_eq!(window.last().unwrap().position(), 19);
    }

    #[tokio::test]
    async fn test_contiguous_inserts_compact() {
        let log = log_with(100);
        let file = Uuid::new_v4();
        let user = Uuid::from_u128(1);

        log.push(file, &Operation::insert(0, "he", user, ts(1))).await.unwrap();
        log.push(file, &Operation::insert(2, "llo", user, ts(2))).await.unwrap();

        let window = log.list(file).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0], Operation::insert(0, "hello", user, ts(1)));
    }

    #[tokio::test]
    async fn test_other_user_not_compacted() {
        let log = log_with(100);
        let file = Uuid::new_v4();

        log.push(file, &Operation::insert(0, "he", Uuid::from_u128(1), ts(1)))
            .await
            .unwrap();
        log.push(file, &Operation::insert(2, "llo", Uuid::from_u128(2), ts(2)))
            .await
            .unwrap();

        assert_eq!(log.list(file).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_noop_still_recorded() {
        let log = log_with(100);
        let file = Uuid::new_v4();
        let op = Operation::delete(3, 0, Uuid::from_u128(1), ts(1));

        log.push(file, &op).await.unwrap();
        let window = log.list(file).await.unwrap();
        assert_eq!(window.len(), 1);
        assert!(window[0].is_noop());
    }

    #[tokio::test]
    async fn test_clear() {
        let log = log_with(100);
        let file = Uuid::new_v4();
        log.push(file, &Operation::insert(0, "a", Uuid::from_u128(1), ts(1)))
            .await
            .unwrap();
        log.clear(file).await.unwrap();
        assert!(log.list(file).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_window_expires_after_inactivity() {
        let log = OperationLog::new(
            Arc::new(MemoryEphemeralStore::new()),
            100,
            Duration::from_millis(10),
        );
        let file = Uuid::new_v4();
        log.push(file, &Operation::insert(0, "a", Uuid::from_u128(1), ts(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(log.list(file).await.unwrap().is_empty());
    }
}
