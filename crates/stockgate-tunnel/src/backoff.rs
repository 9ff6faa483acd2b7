//! Reconnection backoff.

use std::time::Duration;

/// Exponential backoff reconnection policy.
///
/// The policy holds no state; the caller counts consecutive failures and
/// asks for the delay that goes with the count.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of consecutive failures (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after `failures` consecutive failed attempts (1-indexed).
    ///
    /// Always within `[initial_delay, max_delay]`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.max(1.0).powi(exponent);
        let capped_ms = delay_ms
            .min(self.max_delay.as_millis() as f64)
            .max(base_ms);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made after `failures` consecutive failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }
}
