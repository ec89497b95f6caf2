//! Admission event observers.
//!
//! The limiter reports what it decided to observers instead of logging
//! inline. [`TracingObserver`] turns events into structured log records and
//! [`AdmissionStats`] keeps per-tier counters for the admin API.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, error, info, trace};

use super::identity::{IdentityKey, Tier};
use super::limiter::Decision;
use crate::store::StoreError;

/// Receives the outcome of every limiter operation.
pub trait AdmissionObserver: Send + Sync {
    /// A verdict was reached for `key`.
    fn on_decision(&self, key: &IdentityKey, decision: &Decision);

    /// The store failed, so no verdict exists for `key`.
    fn on_store_failure(&self, key: &IdentityKey, error: &StoreError);

    /// The window for `key` was cleared by an administrator.
    fn on_reset(&self, _key: &IdentityKey) {}
}

/// Emits admission events as `tracing` records.
///
/// Rejections are ordinary outcomes and stay at `debug`; only store failures
/// are reported as errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl AdmissionObserver for TracingObserver {
    fn on_decision(&self, key: &IdentityKey, decision: &Decision) {
        if decision.allowed {
            trace!(
                key = %key,
                count = decision.count,
                limit = decision.limit,
                "Request admitted"
            );
        } else {
            debug!(
                key = %key,
                count = decision.count,
                limit = decision.limit,
                "Rate limit exceeded"
            );
        }
    }

    fn on_store_failure(&self, key: &IdentityKey, error: &StoreError) {
        error!(
            key = %key,
            error = %error,
            "Counter store failure, no admission verdict"
        );
    }

    fn on_reset(&self, key: &IdentityKey) {
        info!(key = %key, "Rate limit window reset");
    }
}

#[derive(Debug, Default)]
struct TierCounters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    store_failures: AtomicU64,
    resets: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self) -> TierStats {
        TierStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Requests allowed through
    pub admitted: u64,
    /// Requests refused for exceeding the limit
    pub rejected: u64,
    /// Checks that failed because the store was unavailable
    pub store_failures: u64,
    /// Windows cleared through the admin API
    pub resets: u64,
}

/// Point-in-time counters for both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests identified by client address
    pub ip: TierStats,
    /// Requests identified by an API token
    pub token: TierStats,
}

/// Process-local admission counters, kept apart per tier.
///
/// Rejections and store failures are tallied separately because they have
/// different causes and remedies.
#[derive(Debug, Default)]
pub struct AdmissionStats {
    ip: TierCounters,
    token: TierCounters,
}

impl AdmissionStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ip: self.ip.snapshot(),
            token: self.token.snapshot(),
        }
    }

    fn counters(&self, tier: Tier) -> &TierCounters {
        match tier {
            Tier::Ip => &self.ip,
            Tier::Token => &self.token,
        }
    }
}

impl AdmissionObserver for AdmissionStats {
    fn on_decision(&self, key: &IdentityKey, decision: &Decision) {
        let counters = self.counters(key.tier());
        if decision.allowed {
            counters.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_store_failure(&self, key: &IdentityKey, _error: &StoreError) {
        self.counters(key.tier())
            .store_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_reset(&self, key: &IdentityKey) {
        self.counters(key.tier())
            .resets
            .fetch_add(1, Ordering::Relaxed);
    }
}
