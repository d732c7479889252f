//! Bounded retry with exponential backoff for transient dispatch failures.
//!
//! The policy is a pure value object: given the attempt that just failed and
//! the kind of failure, it decides whether another attempt is scheduled and
//! how long the retry lane holds it back.
//!
//! # Example
//!
//! ```rust
//! use notification_relay_core::error::ErrorKind;
//! use notification_relay_runtime::retry::{RetryDecision, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//!
//! assert_eq!(
//!     policy.decide(1, ErrorKind::TransientDispatch),
//!     RetryDecision::Retry(Duration::from_secs(1))
//! );
//! assert_eq!(
//!     policy.decide(2, ErrorKind::TransientDispatch),
//!     RetryDecision::Retry(Duration::from_secs(2))
//! );
//! assert_eq!(policy.decide(3, ErrorKind::TransientDispatch), RetryDecision::Escalate);
//! assert_eq!(policy.decide(1, ErrorKind::PermanentDispatch), RetryDecision::Escalate);
//! ```

use crate::worker::ConsumerSettings;
use notification_relay_core::error::ErrorKind;
use std::time::Duration;

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the second attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
/// Default backoff multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default cap on a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay
    Retry(Duration),
    /// Stop retrying and dead-letter the message
    Escalate,
}

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3 (the first attempt plus two retries)
/// - `base_delay`: 1 second
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `max_delay`: 5 minutes
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Maximum delay between attempts (cap for exponential backoff)
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            base_delay: None,
            multiplier: None,
            max_delay: None,
        }
    }

    /// Policy from consumer settings (`maxAttempts`, `baseDelayMs`,
    /// `backoffMultiplier`).
    #[must_use]
    pub fn from_config(settings: &ConsumerSettings) -> Self {
        Self::builder()
            .max_attempts(settings.max_attempts)
            .base_delay(Duration::from_millis(settings.base_delay_ms))
            .multiplier(settings.backoff_multiplier)
            .build()
    }

    /// Calculate the delay after attempt `attempt` failed.
    ///
    /// Uses exponential backoff: `base_delay * multiplier^(attempt - 1)`,
    /// capped at `max_delay`. Attempt 0 is treated as attempt 1.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Decide what happens after attempt `attempt` failed with `kind`.
    ///
    /// Permanent kinds escalate immediately; transient kinds retry until
    /// `attempt` reaches `max_attempts`.
    #[must_use]
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if !kind.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::Escalate;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempt))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    multiplier: Option<f64>,
    max_delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set the maximum number of attempts (at least 1).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay after the first failed attempt.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            base_delay: self.base_delay.unwrap_or(DEFAULT_BASE_DELAY),
            multiplier: self.multiplier.unwrap_or(DEFAULT_MULTIPLIER),
            max_delay: self.max_delay.unwrap_or(DEFAULT_MAX_DELAY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retry_policy_delay_calculation() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(1));
    }

    #[test]
    fn test_retry_policy_max_delay_cap() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        // 1000ms * 10^4 = 10,000,000ms, but capped at 2000ms
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_permanent_kinds_escalate_on_first_attempt() {
        let policy = RetryPolicy::default();
        for kind in [ErrorKind::Decode, ErrorKind::Normalization, ErrorKind::PermanentDispatch] {
            assert_eq!(policy.decide(1, kind), RetryDecision::Escalate);
        }
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let policy = RetryPolicy::builder().max_attempts(0).build();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.decide(1, ErrorKind::TransientDispatch), RetryDecision::Escalate);
    }

    #[test]
    fn test_from_config_uses_settings() {
        let settings = ConsumerSettings::builder()
            .max_attempts(5)
            .base_delay_ms(250)
            .backoff_multiplier(3.0)
            .build();
        let policy = RetryPolicy::from_config(&settings);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2250));
    }

    proptest! {
        #[test]
        fn transient_failures_retry_until_max_attempts(
            max_attempts in 1u32..10,
            base_ms in 1u64..5000,
        ) {
            let policy = RetryPolicy::builder()
                .max_attempts(max_attempts)
                .base_delay(Duration::from_millis(base_ms))
                .max_delay(Duration::from_secs(u64::from(u32::MAX)))
                .build();

            for attempt in 1..max_attempts {
                let expected = Duration::from_millis(base_ms * 2u64.pow(attempt - 1));
                prop_assert_eq!(
                    policy.decide(attempt, ErrorKind::TransientDispatch),
                    RetryDecision::Retry(expected)
                );
            }
            prop_assert_eq!(
                policy.decide(max_attempts, ErrorKind::TransientDispatch),
                RetryDecision::Escalate
            );
        }
    }
}
