//! Rate limiting logic.

mod events;
mod identity;
mod limiter;
mod policy;

pub use events::{AdmissionObserver, AdmissionStats, StatsSnapshot, TierStats, TracingObserver};
pub use identity::{strip_port, IdentityKey, Tier, UnknownTier, UNKNOWN_CLIENT};
pub use limiter::{Decision, RateLimiter};
pub use policy::Policy;
