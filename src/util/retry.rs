//! Exponential backoff with full jitter for outbound calls.
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryConfig {
    /// Total attempts, including the first one.
    pub(crate) max_attempts: usize,
    pub(crate) base_delay_ms: u64,
    pub(crate) max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub(crate) const fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Random delay in `0..=min(base * 2^(attempt-1), max)`; attempt 0 waits nothing.
    #[must_use]
    pub(crate) fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let shift = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
        let exponential_delay = self
            .base_delay_ms
            .saturating_mul(1_u64.checked_shl(shift).unwrap_or(u64::MAX));
        let capped_delay = exponential_delay.min(self.max_delay_ms);

        let jittered_delay = if capped_delay > 0 {
            rand::rng().random_range(0..=capped_delay)
        } else {
            0
        };

        Duration::from_millis(jittered_delay)
    }

    #[must_use]
    pub(crate) const fn can_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

/// Network errors, timeouts, 5xx and 429 are worth another attempt.
pub(crate) fn is_retryable_error(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }

    error.status().is_some_and(|status| {
        status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    })
}

/// Same policy for a status returned without a transport error.
pub(crate) fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}
