//! Retry policy: decides backoff delays and how many retries a failure class gets.

use std::time::Duration;

use rand::Rng;

use crate::config::RetrySettings;
use crate::domain::ErrorClass;

/// Retry policy for failed external calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Relative jitter (0.25 = ±25%).
    pub jitter: f64,

    /// Upper bound of any single delay, `retry_after` hints included.
    pub max_delay: Duration,

    pub max_rate_limit_retries: u32,
    pub max_server_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base_delay: settings.base_delay,
            multiplier: settings.multiplier,
            jitter: settings.jitter,
            max_delay: settings.max_delay,
            max_rate_limit_retries: settings.max_rate_limit_retries,
            max_server_retries: settings.max_server_retries,
        }
    }

    /// How many retries a failure of `class` gets. Permanent failures get none.
    pub fn max_retries(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::RateLimit => self.max_rate_limit_retries,
            ErrorClass::Transient => self.max_server_retries,
            ErrorClass::Permanent => 0,
        }
    }

    /// May retry number `retry` (1-indexed) happen for `class`?
    pub fn allows(&self, class: ErrorClass, retry: u32) -> bool {
        retry >= 1 && retry <= self.max_retries(class)
    }

    /// Delay before retry number `retry` (1-indexed), without jitter.
    ///
    /// delay = base_delay * multiplier^(retry - 1), capped at `max_delay`.
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - retry 1: 1s
    /// - retry 2: 2s
    /// - retry 3: 4s
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before retry number `retry`: jittered backoff, at least the
    /// provider's `retry_after` hint, never above `max_delay`.
    pub fn next_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        let jittered = self.base_delay_for(retry).mul_f64(factor);
        jittered
            .max(retry_after.unwrap_or(Duration::ZERO))
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_matches_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_retries(ErrorClass::RateLimit), 3);
        assert_eq!(policy.max_retries(ErrorClass::Transient), 2);
        assert_eq!(policy.max_retries(ErrorClass::Permanent), 0);
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.base_delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn base_delays_never_decrease_and_stay_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=40).map(|r| policy.base_delay_for(r)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(*delays.last().unwrap(), policy.max_delay);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    fn jitter_stays_within_bounds(#[case] retry: u32) {
        let policy = RetryPolicy::default();
        let base = policy.base_delay_for(retry);
        for _ in 0..100 {
            let d = policy.next_delay(retry, None);
            assert!(d >= base.mul_f64(0.75) && d <= base.mul_f64(1.25), "{d:?}");
        }
    }

    #[test]
    fn retry_after_hint_is_a_floor_but_capped() {
        let policy = RetryPolicy::default();
        assert!(policy.next_delay(1, Some(Duration::from_secs(20))) >= Duration::from_secs(20));
        assert_eq!(
            policy.next_delay(1, Some(Duration::from_secs(600))),
            policy.max_delay
        );
    }

    #[rstest]
    #[case(ErrorClass::RateLimit, 3, true)]
    #[case(ErrorClass::RateLimit, 4, false)]
    #[case(ErrorClass::Transient, 2, true)]
    #[case(ErrorClass::Transient, 3, false)]
    #[case(ErrorClass::Permanent, 1, false)]
    fn retry_caps_per_class(#[case] class: ErrorClass, #[case] retry: u32, #[case] allowed: bool) {
        assert_eq!(RetryPolicy::default().allows(class, retry), allowed);
    }
}
