//! Shared counter storage.
//!
//! The rate limiter only ever talks to a [`CounterStore`]. Deployments back it
//! with Redis so that every instance of the service sees the same counters;
//! tests and single-node setups use the in-process [`MemoryCounterStore`].

mod backend;
mod memory;
mod redis_store;

use std::time::Duration;

use thiserror::Error;

pub use backend::CounterStore;
pub use memory::MemoryCounterStore;
pub use redis_store::{RedisCounterStore, RedisStoreOptions};

/// A transient failure reaching the counter store.
///
/// None of these are admission verdicts: callers must surface them instead of
/// guessing whether the request would have been allowed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection, protocol or server-side failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer within the configured bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The store operation that was abandoned
        operation: &'static str,
        /// The bound that elapsed
        after: Duration,
    },

    /// The store handle was torn down by [`CounterStore::close`].
    #[error("counter store is closed")]
    Closed,
}
