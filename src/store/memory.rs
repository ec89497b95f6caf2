//! In-process counter store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::{CounterStore, StoreError};

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    /// `None` until the first `set_with_expiry` for this epoch
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// A [`CounterStore`] held in a sharded in-process map.
///
/// Each key is updated under its shard lock, which gives `increment` the same
/// atomicity a networked store provides. Counters are only shared within one
/// process, so this is suitable for tests and single-instance deployments.
///
/// Expiry follows tokio's clock, so paused-time tests can step over windows.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Entry>,
    closed: AtomicBool,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired counter and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| entry.is_live(now));
        let purged = before.saturating_sub(self.counters.len());
        if purged > 0 {
            debug!(purged, "Purged expired counters");
        }
        purged
    }

    /// Number of counters currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let now = Instant::now();

        let mut entry = self.counters.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                count: 0,
                expires_at: None,
            };
        }
        entry.count += 1;

        Ok(entry.count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.ensure_open()?;
        let now = Instant::now();

        Ok(self
            .counters
            .get(key)
            .and_then(|entry| entry.is_live(now).then_some(entry.count)))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let now = Instant::now();

        let mut entry = self.counters.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: None,
        });
        let current = if entry.is_live(now) { entry.count } else { 0 };
        *entry = Entry {
            count: current.max(value),
            expires_at: Some(now + ttl),
        };

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.counters.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.counters.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_creates_counter_at_one() {
        let store = MemoryCounterStore::new();

        assert_eq!(store.increment("a").await.unwrap(), 1);
        assert_eq!(store.increment("a").await.unwrap(), 2);
        assert_eq!(store.increment("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.increment("present").await.unwrap();
        assert_eq!(store.get("present").await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_expires_after_ttl() {
        let store = MemoryCounterStore::new();

        store.increment("k").await.unwrap();
        store
            .set_with_expiry("k", 1, Duration::from_secs(1))
            .await
            .unwrap();
        store.increment("k").await.unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(2));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);

        // The next increment starts a new epoch
        assert_eq!(store.increment("k").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_with_expiry_refreshes_ttl() {
        let store = MemoryCounterStore::new();

        store
            .set_with_expiry("k", 3, Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        store
            .set_with_expiry("k", 3, Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;

        assert_eq!(store.get("k").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_set_with_expiry_keeps_concurrent_increments() {
        let store = MemoryCounterStore::new();

        assert_eq!(store.increment("k").await.unwrap(), 1);
        // Another caller increments before the window expiry is written
        assert_eq!(store.increment("k").await.unwrap(), 2);
        store
            .set_with_expiry("k", 1, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(2));
        assert_eq!(store.increment("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_removes_counter() {
        let store = MemoryCounterStore::new();

        store.increment("k").await.unwrap();
        store.delete("k").await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k").await.unwrap(), 1);

        // Deleting an absent key is not an error
        store.delete("never").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryCounterStore::new();

        store
            .set_with_expiry("short", 1, Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_with_expiry("long", 1, Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = MemoryCounterStore::new();
        store.increment("k").await.unwrap();

        store.close().await.unwrap();

        assert!(matches!(store.increment("k").await, Err(StoreError::Closed)));
        assert!(matches!(store.get("k").await, Err(StoreError::Closed)));
        assert!(matches!(store.delete("k").await, Err(StoreError::Closed)));
    }
}
