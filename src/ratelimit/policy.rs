//! Rate limit policy.

use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// How many requests an identity may make per window.
///
/// The window opens with the first counted request for an identity and closes
/// `window` later; it is not aligned to wall-clock boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    requests_per_window: u64,
    window: Duration,
}

impl Policy {
    /// Create a policy, rejecting a zero limit or an empty window.
    pub fn new(requests_per_window: u64, window: Duration) -> Result<Self> {
        if requests_per_window == 0 {
            return Err(TurnstileError::Config(
                "requests_per_window must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "window duration must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            requests_per_window,
            window,
        })
    }

    /// Maximum number of admitted requests per window.
    pub fn requests_per_window(&self) -> u64 {
        self.requests_per_window
    }

    /// Length of a window.
    pub fn window(&self) -> Duration {
        self.window
    }
}
