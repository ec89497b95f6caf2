//! Counter store trait shared by the Redis and in-memory implementations.

use std::time::Duration;

use async_trait::async_trait;

use super::StoreError;

/// An integer counter service with per-key expiry.
///
/// Implementations are shared by every request task, so they must be safe for
/// concurrent use. `increment` is the atomicity boundary of the whole rate
/// limiter: concurrent increments of one key must each be applied exactly once
/// and each caller must observe a distinct resulting value.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to the counter for `key`, creating it at 1 if absent or
    /// expired, and return the new value.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Read the current count, or `None` if the key does not exist or expired.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Write `value` and (re)set the key to expire `ttl` from now.
    ///
    /// A live counter that has already advanced past `value` keeps its
    /// current count; only the expiry is refreshed.
    async fn set_with_expiry(&self, key: &str, value: u64, ttl: Duration)
        -> Result<(), StoreError>;

    /// Remove the counter immediately, regardless of its expiry.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Tear down the handle. Every later call fails with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
