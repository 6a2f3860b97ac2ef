//! Retry policy for the optimistic-concurrency loops.
//!
//! The default policy retries forever with no pause, so a request under
//! sustained contention can in principle spin indefinitely. Deployments that
//! prefer a bounded failure set `max_attempts`, and `backoff` spaces retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::IpamError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed per request; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Pause before every attempt after the first
    #[serde(default, with = "humantime_serde")]
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        RetryPolicy { max_attempts: Some(max_attempts), backoff: Duration::ZERO }
    }

    /// Gate attempt number `attempt` (zero-based) of `operation`.
    pub fn admit(&self, attempt: u32, operation: &str) -> Result<(), IpamError> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return Err(IpamError::Internal(format!("{} gave up after {} attempts", operation, attempt)));
            }
        }
        if attempt > 0 {
            log::debug!("Retrying {} (attempt {})", operation, attempt + 1);
            if !self.backoff.is_zero() {
                std::thread::sleep(self.backoff);
            }
        }
        Ok(())
    }
}
