use std::time::Duration;

use rand::Rng;

use crate::error::AppError;

/// Retry behaviour for upstream calls gated by the rate limiter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Deadline for passing the global and category buckets
    pub acquire_timeout: Duration,
    /// Base of the exponential backoff after a quota signal
    pub quota_base: Duration,
    /// Step of the linear backoff after a transient failure
    pub transient_step: Duration,
    /// Maximum fraction of the delay added as random jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            acquire_timeout: Duration::from_secs(5),
            quota_base: Duration::from_secs(1),
            transient_step: Duration::from_millis(500),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `error` on attempt `attempt` (0-based)
    ///
    /// `None` means the error must not be retried, either because of its
    /// kind or because retries are exhausted. Quota errors back off
    /// exponentially and honor a larger upstream `Retry-After`; transient
    /// errors back off linearly.
    pub fn backoff(&self, attempt: u32, error: &AppError) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }

        match error {
            AppError::QuotaExceeded { retry_after, .. } => {
                let exponential = self.quota_base.saturating_mul(2u32.saturating_pow(attempt));
                Some(match retry_after {
                    Some(hint) if *hint > exponential => *hint,
                    _ => exponential,
                })
            }
            e if e.is_transient() => Some(self.transient_step.saturating_mul(attempt + 1)),
            _ => None,
        }
    }

    /// Adds up to `jitter · delay` of random slack
    pub fn with_jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        delay + delay.mul_f64(rng.gen_range(0.0..self.jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn quota(retry_after: Option<Duration>) -> AppError {
        AppError::QuotaExceeded {
            message: "429 Too Many Requests".to_string(),
            retry_after,
        }
    }

    #[test]
    fn test_quota_backoff_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0, &quota(None)), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff(1, &quota(None)), Some(Duration::from_secs(2)));
        assert_eq!(policy.backoff(2, &quota(None)), Some(Duration::from_secs(4)));
        assert_eq!(policy.backoff(3, &quota(None)), None);
    }

    #[test]
    fn test_quota_backoff_honors_larger_retry_after() {
        let policy = RetryPolicy::default();
        let err = quota(Some(Duration::from_secs(7)));
        assert_eq!(policy.backoff(0, &err), Some(Duration::from_secs(7)));

        let small = quota(Some(Duration::from_millis(10)));
        assert_eq!(policy.backoff(2, &small), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_transient_backoff_is_linear() {
        let policy = RetryPolicy::default();
        let err = AppError::UpstreamUnavailable("503".to_string());
        assert_eq!(policy.backoff(0, &err), Some(Duration::from_millis(500)));
        assert_eq!(policy.backoff(1, &err), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.backoff(2, &err), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn test_final_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0, &AppError::ExternalApi("404".to_string())), None);
        assert_eq!(policy.backoff(0, &AppError::InvalidInput("bad".to_string())), None);
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let delay = policy.with_jitter(Duration::from_secs(1), &mut rng);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_millis(1_100));
        }

        let none = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(none.with_jitter(Duration::from_secs(1), &mut rng), Duration::from_secs(1));
    }
}
