//! Retry/backoff policy for transport errors (§4.6.3).
//!
//! Hash mismatches are never retried — they surface immediately as
//! [`vmrkl_core::error::ChannelError::Integrity`] — this module only
//! covers the transport-error path.

use std::time::Duration;

/// Tunables for the transport-fetch retry loop.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first) before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent attempt.
    pub base_delay: Duration,
    /// Per-request timeout passed to the transport.
    pub fetch_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// The delay to sleep before attempt number `attempt` (zero-indexed;
    /// `attempt == 0` is the first retry, after the initial try).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.min(16))
    }
}
