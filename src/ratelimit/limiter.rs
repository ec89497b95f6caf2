//! Core rate limiter implementation.

use std::sync::Arc;

use super::events::{AdmissionObserver, TracingObserver};
use super::identity::IdentityKey;
use super::policy::Policy;
use crate::error::Result;
use crate::store::{CounterStore, StoreError};

/// The verdict for a single request.
///
/// Being over the limit is an ordinary outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The identity's count in the current window, including this request
    pub count: u64,
    /// The policy limit the count was compared against
    pub limit: u64,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Requests left in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// A fixed-window rate limiter over a shared [`CounterStore`].
///
/// The limiter holds no mutable state of its own. Every check increments the
/// identity's counter first and compares afterwards, so the store's atomic
/// increment is the only synchronization point, no matter how many tasks or
/// service instances check the same identity at once.
pub struct RateLimiter {
    /// Shared counter store
    store: Arc<dyn CounterStore>,
    /// Limit and window applied to every identity
    policy: Policy,
    /// Receivers of admission events
    observers: Vec<Arc<dyn AdmissionObserver>>,
}

impl RateLimiter {
    /// Create a rate limiter that reports events through `tracing`.
    pub fn new(store: Arc<dyn CounterStore>, policy: Policy) -> Self {
        Self {
            store,
            policy,
            observers: vec![Arc::new(TracingObserver)],
        }
    }

    /// Add another receiver of admission events.
    pub fn with_observer(mut self, observer: Arc<dyn AdmissionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Count a request for `key` and decide whether it may proceed.
    ///
    /// The request is counted even when it is rejected. A store failure is
    /// returned as an error and carries no verdict.
    pub async fn allow(&self, key: &IdentityKey) -> Result<Decision> {
        let count = match self.count_request(key).await {
            Ok(count) => count,
            Err(error) => {
                self.observers
                    .iter()
                    .for_each(|o| o.on_store_failure(key, &error));
                return Err(error.into());
            }
        };

        let limit = self.policy.requests_per_window();
        let decision = Decision {
            allowed: count <= limit,
            count,
            limit,
        };
        self.observers
            .iter()
            .for_each(|o| o.on_decision(key, &decision));

        Ok(decision)
    }

    /// Increment the counter and open the window if this request created it.
    ///
    /// Both store calls run on a detached task. Dropping the caller's future
    /// (a client disconnect, an outer timeout) stops the wait, not the
    /// writes, so a counter created here always receives its expiry.
    async fn count_request(&self, key: &IdentityKey) -> std::result::Result<u64, StoreError> {
        let store = Arc::clone(&self.store);
        let key = key.as_str().to_string();
        let window = self.policy.window();

        let task = tokio::spawn(async move {
            let count = store.increment(&key).await?;

            // The increment that creates the counter opens the window
            if count == 1 {
                store.set_with_expiry(&key, count, window).await?;
            }

            Ok::<u64, StoreError>(count)
        });

        match task.await {
            Ok(result) => result,
            Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
            // The runtime is shutting down
            Err(_) => Err(StoreError::Closed),
        }
    }

    /// End the current window for `key` immediately.
    pub async fn reset(&self, key: &IdentityKey) -> Result<()> {
        if let Err(error) = self.store.delete(key.as_str()).await {
            self.observers
                .iter()
                .for_each(|o| o.on_store_failure(key, &error));
            return Err(error.into());
        }

        self.observers.iter().for_each(|o| o.on_reset(key));
        Ok(())
    }

    /// Read the count in the current window without counting a request.
    ///
    /// Returns `None` if `key` has no active window.
    pub async fn count(&self, key: &IdentityKey) -> Result<Option<u64>> {
        Ok(self.store.get(key.as_str()).await?)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("observers", &self.observers.len())
            .finish()
    }
}
