//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure batch redelivery.
use std::time;

use rand::Rng;

#[derive(Clone, Debug)]
/// A retry policy to determine how long a failed batch waits before its next attempt.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Spread each interval randomly over `[candidate, 2 * candidate)` so clients that failed
    /// together do not retry together.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// The un-jittered interval for a given attempt number, saturating instead of overflowing.
    fn candidate_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_interval
            .checked_mul(factor)
            .unwrap_or(time::Duration::MAX)
    }

    /// Determine interval for retrying at a given attempt number.
    /// If not `None`, this method will respect `preferred_retry_interval` as long as it falls within `candidate_interval <= preferred_retry_interval <= maximum_interval`.
    ///
    /// With a coefficient of at least 2, intervals strictly increase with the attempt number
    /// until they reach `maximum_interval`, jitter included.
    pub fn retry_interval(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let mut candidate_interval = self.candidate_interval(attempt);
        if self.jitter {
            let spread = rand::thread_rng().gen_range(1.0..2.0);
            candidate_interval = time::Duration::try_from_secs_f64(
                candidate_interval.as_secs_f64() * spread,
            )
            .unwrap_or(candidate_interval);
        }

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => {
                let min_interval_allowed = std::cmp::min(candidate_interval, max_interval);

                if min_interval_allowed <= duration && duration <= max_interval {
                    duration
                } else {
                    min_interval_allowed
                }
            }
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    pub jitter: bool,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(25),
            maximum_interval: Some(time::Duration::from_secs(1)),
            jitter: true,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn unbounded(mut self) -> RetryPolicyBuilder {
        self.maximum_interval = None;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> RetryPolicyBuilder {
        self.jitter = jitter;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            jitter: self.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2))
            .jitter(false)
            .provide();
        let first_interval = retry_policy.retry_interval(1, None);
        let second_interval = retry_policy.retry_interval(2, None);
        let third_interval = retry_policy.retry_interval(3, None);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(2));
        assert_eq!(third_interval, time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();
        for attempt in 1..10 {
            assert!(retry_policy.retry_interval(attempt, None) <= time::Duration::from_secs(4));
        }
        assert_eq!(
            retry_policy.retry_interval(3, None),
            time::Duration::from_secs(4)
        );
    }

    #[test]
    fn test_retry_interval_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .unbounded()
            .jitter(false)
            .provide();
        let first_interval = retry_policy.retry_interval(1, None);
        let second_interval = retry_policy.retry_interval(2, None);
        let third_interval = retry_policy.retry_interval(3, None);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(4));
        assert_eq!(third_interval, time::Duration::from_secs(8));
    }

    #[test]
    fn test_jittered_intervals_strictly_increase_until_capped() {
        let retry_policy = RetryPolicy::default();

        for _ in 0..100 {
            let intervals: Vec<_> = (1..=5)
                .map(|attempt| retry_policy.retry_interval(attempt, None))
                .collect();

            assert!(intervals[0] >= time::Duration::from_millis(25));
            assert!(intervals[0] < time::Duration::from_millis(50));
            for pair in intervals.windows(2) {
                assert!(pair[0] < pair[1] || pair[1] == time::Duration::from_secs(1));
            }
        }
    }

    #[test]
    fn test_retry_interval_saturates_on_large_attempts() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(
            retry_policy.retry_interval(u32::MAX, None),
            time::Duration::from_secs(1)
        );
    }

    #[test]
    fn test_retry_interval_respects_preferred() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(1000))
            .jitter(false)
            .provide();
        let preferred = time::Duration::from_secs(999);
        let first_interval = retry_policy.retry_interval(1, Some(preferred));
        let second_interval = retry_policy.retry_interval(2, Some(preferred));

        assert_eq!(first_interval, preferred);
        assert_eq!(second_interval, preferred);
    }

    #[test]
    fn test_retry_interval_ignores_small_preferred() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(5))
            .unbounded()
            .jitter(false)
            .provide();
        let preferred = time::Duration::from_secs(2);
        let first_interval = retry_policy.retry_interval(1, Some(preferred));
        let second_interval = retry_policy.retry_interval(2, Some(preferred));

        assert_eq!(first_interval, time::Duration::from_secs(5));
        assert_eq!(second_interval, time::Duration::from_secs(5));
    }

    #[test]
    fn test_retry_interval_ignores_large_preferred() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .jitter(false)
            .provide();
        let preferred = time::Duration::from_secs(10);
        let first_interval = retry_policy.retry_interval(1, Some(preferred));
        let second_interval = retry_policy.retry_interval(2, Some(preferred));
        let third_interval = retry_policy.retry_interval(3, Some(preferred));

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(4));
        assert_eq!(third_interval, time::Duration::from_secs(4));
    }
}
