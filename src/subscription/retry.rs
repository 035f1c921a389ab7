//! Retry policies applied when creating or repairing a stream
//! subscription fails.
//!
//! A policy answers two questions: how long to wait before attempt
//! `n + 1` (`None` meaning give up), and whether the error that was just
//! observed is worth retrying at all. The default classification treats
//! invalid requests as permanent and everything else as transient.

use std::time::Duration;

use crate::subscription::SubscribeError;

/// Decides whether and when a failed subscribe attempt is retried.
///
/// `attempt` counts the failures observed so far, starting at 1.
pub trait RetryPolicy: Send + Sync {
    /// The delay to wait before the next attempt, or `None` to give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Whether the observed error is worth retrying.
    ///
    /// The default classification retries transient errors only.
    fn should_retry(&self, error: &SubscribeError, attempt: u32) -> bool {
        let _ = attempt;
        error.is_transient()
    }
}

/// Never retries: the first failure surfaces to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Retries up to `retries` times, spaced by a constant interval.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    /// Maximum number of retries.
    pub retries: u32,

    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for FixedInterval {
    fn default() -> Self {
        Self {
            retries: 3,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy for FixedInterval {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.retries).then_some(self.interval)
    }
}

/// Retries with exponentially growing delays:
/// `delay(n) = min(initial * multiplier^(n - 1), max_delay)`, optionally
/// spread with full-range jitter (multiplying by `0.5 + rand * 0.5`).
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// Maximum number of retries.
    pub retries: u32,

    /// Delay before the first retry.
    pub initial: Duration,

    /// Growth factor applied per attempt.
    pub multiplier: f64,

    /// Upper bound on the computed delay.
    pub max_delay: Duration,

    /// Whether to spread delays with full-range jitter.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            retries: 5,
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.retries {
            return None;
        }

        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial.mul_f64(factor.max(0.0)).min(self.max_delay);

        if self.jitter {
            Some(delay.mul_f64(0.5 + rand::random::<f64>() * 0.5))
        } else {
            Some(delay)
        }
    }
}

/// Retries with linearly growing delays:
/// `delay(n) = min(n * increment, max_delay)`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    /// Maximum number of retries.
    pub retries: u32,

    /// Delay increment added per attempt.
    pub increment: Duration,

    /// Upper bound on the computed delay.
    pub max_delay: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            retries: 5,
            increment: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy for LinearBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.retries).then(|| (self.increment * attempt).min(self.max_delay))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::AgentId;

    #[test]
    fn no_retry_gives_up_immediately() {
        assert_eq!(None, NoRetry.next_delay(1));
    }

    #[test]
    fn fixed_interval_is_constant_until_exhausted() {
        let policy = FixedInterval {
            retries: 2,
            interval: Duration::from_millis(250),
        };

        assert_eq!(Some(Duration::from_millis(250)), policy.next_delay(1));
        assert_eq!(Some(Duration::from_millis(250)), policy.next_delay(2));
        assert_eq!(None, policy.next_delay(3));
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = ExponentialBackoff {
            retries: 10,
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            jitter: false,
        };

        assert_eq!(Some(Duration::from_millis(100)), policy.next_delay(1));
        assert_eq!(Some(Duration::from_millis(200)), policy.next_delay(2));
        assert_eq!(Some(Duration::from_millis(400)), policy.next_delay(3));
        assert_eq!(Some(Duration::from_millis(500)), policy.next_delay(4));
        assert_eq!(None, policy.next_delay(11));
    }

    #[test]
    fn jittered_delays_stay_within_half_to_full_range() {
        let policy = ExponentialBackoff {
            jitter: true,
            ..ExponentialBackoff::default()
        };

        for _ in 0..100 {
            let delay = policy.next_delay(1).unwrap();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn linear_backoff_grows_by_increment_and_caps() {
        let policy = LinearBackoff {
            retries: 10,
            increment: Duration::from_millis(300),
            max_delay: Duration::from_millis(700),
        };

        assert_eq!(Some(Duration::from_millis(300)), policy.next_delay(1));
        assert_eq!(Some(Duration::from_millis(600)), policy.next_delay(2));
        assert_eq!(Some(Duration::from_millis(700)), policy.next_delay(3));
        assert_eq!(None, policy.next_delay(11));
    }

    #[test]
    fn default_classification_only_retries_transient_errors() {
        let policy = FixedInterval::default();

        assert!(policy.should_retry(&SubscribeError::StreamClosed(AgentId::new_v4()), 1));
        assert!(!policy.should_retry(
            &SubscribeError::Invalid("subscriber and stream owner are unset".into()),
            1
        ));
    }
}
