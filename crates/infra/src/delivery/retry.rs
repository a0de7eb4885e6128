//! Backoff for transient send failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = send once).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay (0.0-1.0) spread around it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(retry.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic spread keyed on the retry number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let offset = if jitter_range > 0.0 {
            let pseudo_random = ((retry as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + offset).max(0.0) as u64)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_double_up_to_the_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(20), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::default();
        for retry in 1..=10 {
            let plain = RetryPolicy {
                jitter: 0.0,
                ..policy.clone()
            }
            .delay_for_retry(retry)
            .as_millis() as f64;
            let jittered = policy.delay_for_retry(retry).as_millis() as f64;
            assert!((jittered - plain).abs() <= plain * 0.1 + 1.0);
        }
    }

    #[test]
    fn retry_budget() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }
}
