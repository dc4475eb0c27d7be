//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MAX_ATTEMPTS_ENV: &str = "ENTITLE_CONNECT_MAX_ATTEMPTS";
pub const BASE_DELAY_MS_ENV: &str = "ENTITLE_CONNECT_BASE_DELAY_MS";
pub const PURCHASE_TIMEOUT_SECS_ENV: &str = "ENTITLE_PURCHASE_TIMEOUT_SECS";

/// How the delay grows between reconnect attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// base * 2^(attempt - 1)
    Exponential,
    /// base * attempt
    #[default]
    Linear,
}

/// Bounded reconnect policy.
///
/// `attempt` counts consecutive failed connects, starting at 1. A failure with
/// `attempt < max_attempts` schedules another connect; the failure that reaches
/// `max_attempts` ends the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(2), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// A single connect per cycle; the first failure is final.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2_u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Configuration for [`crate::BillingClient`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    /// How long a launched purchase may wait for its notification.
    /// `None` waits as long as the caller holds the purchase stream.
    pub purchase_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_purchase_timeout(mut self, timeout: Duration) -> Self {
        self.purchase_timeout = Some(timeout);
        self
    }

    /// Defaults overridden by `ENTITLE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(max_attempts) = parse_var::<u32>(&lookup, MAX_ATTEMPTS_ENV) {
            if max_attempts == 0 {
                warn!(var = MAX_ATTEMPTS_ENV, "must be at least 1; using default");
            } else {
                config.retry.max_attempts = max_attempts;
            }
        }
        if let Some(ms) = parse_var::<u64>(&lookup, BASE_DELAY_MS_ENV) {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, PURCHASE_TIMEOUT_SECS_ENV) {
            config.purchase_timeout = Some(Duration::from_secs(secs));
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = key, value = %raw, "invalid value; using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn default_policy_is_three_linear_attempts_two_seconds_apart() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn exponential_delays_double_until_capped() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(3));
    }

    #[test]
    fn fixed_and_no_retry() {
        let fixed = RetryPolicy::fixed(4, Duration::from_secs(1));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_secs(1));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn env_overrides_retry_settings() {
        let config = ClientConfig::from_lookup(lookup(&[
            (MAX_ATTEMPTS_ENV, "5"),
            (BASE_DELAY_MS_ENV, "250"),
            (PURCHASE_TIMEOUT_SECS_ENV, "90"),
        ]));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.purchase_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn invalid_env_values_fall_back_to_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            (MAX_ATTEMPTS_ENV, "zero"),
            (BASE_DELAY_MS_ENV, "-1"),
        ]));
        assert_eq!(config, ClientConfig::default());

        let config = ClientConfig::from_lookup(lookup(&[(MAX_ATTEMPTS_ENV, "0")]));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn policy_round_trips_through_json() {
        let json = serde_json::to_value(RetryPolicy::default()).unwrap();
        assert_eq!(json["strategy"], "linear");
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, RetryPolicy::default());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: linear delay is base * attempt, never above the cap.
            #[test]
            fn linear_delay_is_proportional_and_capped(
                base_ms in 1u64..5_000,
                cap_ms in 1u64..120_000,
                attempt in 1u32..50,
            ) {
                let policy = RetryPolicy::linear(
                    50,
                    Duration::from_millis(base_ms),
                    Duration::from_millis(cap_ms),
                );
                let expected = (base_ms * u64::from(attempt)).min(cap_ms);
                prop_assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(expected));
            }
        }
    }
}
