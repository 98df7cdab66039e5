//! Admission control for the quota-constrained catalog API
//!
//! Every upstream call passes a global bucket and then the bucket of its
//! endpoint category. [`UpstreamRateLimiter::rate_limited_call`] wraps a call
//! with admission plus the retry behaviour of a [`RetryPolicy`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AppError, AppResult};

pub mod retry;
pub mod token_bucket;
pub mod user;

pub use retry::RetryPolicy;
pub use token_bucket::{BucketConfig, BucketStats, TokenBucket};
pub use user::{UserDecision, UserRateLimiter, UserRateStats};

/// Longest single sleep while waiting for a token
const MAX_WAIT_STEP: Duration = Duration::from_millis(100);

/// Upstream endpoint families, each with its own budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    Search,
    Tracks,
    Artists,
    AudioFeatures,
    Recommendations,
    UserData,
    Playlists,
}

impl EndpointCategory {
    pub const ALL: [EndpointCategory; 7] = [
        EndpointCategory::Search,
        EndpointCategory::Tracks,
        EndpointCategory::Artists,
        EndpointCategory::AudioFeatures,
        EndpointCategory::Recommendations,
        EndpointCategory::UserData,
        EndpointCategory::Playlists,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::Search => "search",
            EndpointCategory::Tracks => "tracks",
            EndpointCategory::Artists => "artists",
            EndpointCategory::AudioFeatures => "audio_features",
            EndpointCategory::Recommendations => "recommendations",
            EndpointCategory::UserData => "user_data",
            EndpointCategory::Playlists => "playlists",
        }
    }

    pub fn default_limits(&self) -> BucketConfig {
        match self {
            EndpointCategory::Search
            | EndpointCategory::Tracks
            | EndpointCategory::Artists
            | EndpointCategory::AudioFeatures => BucketConfig::new(10.0, 20),
            EndpointCategory::Recommendations | EndpointCategory::Playlists => {
                BucketConfig::new(5.0, 10)
            }
            EndpointCategory::UserData => BucketConfig::new(3.0, 5),
        }
    }
}

impl std::fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub global: BucketStats,
    pub endpoints: Vec<BucketStats>,
}

/// Global plus per-category token buckets; process-local
pub struct UpstreamRateLimiter {
    global: TokenBucket,
    buckets: HashMap<EndpointCategory, TokenBucket>,
}

impl Default for UpstreamRateLimiter {
    fn default() -> Self {
        Self::new(BucketConfig::new(20.0, 50))
    }
}

impl UpstreamRateLimiter {
    /// Creates a limiter with default category budgets under `global`
    pub fn new(global: BucketConfig) -> Self {
        Self::with_limits(global, |category| category.default_limits())
    }

    pub fn with_limits(
        global: BucketConfig,
        limits: impl Fn(EndpointCategory) -> BucketConfig,
    ) -> Self {
        let buckets = EndpointCategory::ALL
            .iter()
            .map(|category| {
                (
                    *category,
                    TokenBucket::new(category.as_str(), limits(*category)),
                )
            })
            .collect();

        Self {
            global: TokenBucket::new("global", global),
            buckets,
        }
    }

    fn bucket(&self, category: EndpointCategory) -> AppResult<&TokenBucket> {
        self.buckets.get(&category).ok_or_else(|| {
            AppError::Internal(format!("no rate bucket for category {}", category))
        })
    }

    /// Waits on `bucket` until a token is taken or `deadline` passes
    async fn take_before(bucket: &TokenBucket, deadline: Option<Instant>) -> bool {
        loop {
            let wait = match bucket.try_take() {
                Ok(()) => return true,
                Err(wait) => wait,
            };

            let Some(deadline) = deadline else {
                return false;
            };
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let step = wait.min(MAX_WAIT_STEP).min(deadline - now);
            tokio::time::sleep(step.max(Duration::from_millis(1))).await;
        }
    }

    /// Passes the global bucket and then the category bucket within `timeout`
    ///
    /// A zero timeout makes a single non-blocking attempt. Returns false when
    /// either bucket could not be passed in time; a global token taken for a
    /// failed admission is handed back.
    pub async fn acquire(&self, category: EndpointCategory, timeout: Duration) -> bool {
        let bucket = match self.bucket(category) {
            Ok(bucket) => bucket,
            Err(e) => {
                tracing::error!(error = %e, "Rate limiter misconfigured");
                return false;
            }
        };
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        if !Self::take_before(&self.global, deadline).await {
            self.global.record(false);
            bucket.record(false);
            tracing::warn!(category = %category, "Global rate limit admission timed out");
            return false;
        }

        if !Self::take_before(bucket, deadline).await {
            self.global.give_back();
            self.global.record(false);
            bucket.record(false);
            tracing::warn!(category = %category, "Endpoint rate limit admission timed out");
            return false;
        }

        self.global.record(true);
        bucket.record(true);
        true
    }

    /// Single non-blocking admission attempt
    pub async fn try_acquire(&self, category: EndpointCategory) -> bool {
        self.acquire(category, Duration::ZERO).await
    }

    /// Runs `operation` behind admission control, retrying per `policy`
    ///
    /// Every attempt, retries included, must pass admission. A failed
    /// admission ends the call with [`AppError::RateLimitTimeout`]. When
    /// retries are exhausted the last error is returned.
    pub async fn rate_limited_call<T, F, Fut>(
        &self,
        category: EndpointCategory,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if !self.acquire(category, policy.acquire_timeout).await {
                return Err(AppError::RateLimitTimeout(category.to_string()));
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let Some(delay) = policy.backoff(attempt, &error) else {
                if attempt > 0 {
                    tracing::warn!(category = %category, attempts = attempt + 1, error = %error, "Upstream call failed after retries");
                }
                return Err(error);
            };

            let delay = {
                let mut rng = rand::thread_rng();
                policy.with_jitter(delay, &mut rng)
            };
            tracing::warn!(
                category = %category,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying upstream call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            global: self.global.stats(),
            endpoints: EndpointCategory::ALL
                .iter()
                .filter_map(|category| self.buckets.get(category).map(|b| b.stats()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_plus_one_grants_exactly_burst() {
        let limiter = UpstreamRateLimiter::default();
        let mut granted = 0;
        for _ in 0..21 {
            if limiter.try_acquire(EndpointCategory::Search).await {
                granted += 1;
            }
        }
        assert_eq!(granted, 20);

        let stats = limiter.stats();
        let search = &stats.endpoints[0];
        assert_eq!(search.name, "search");
        assert_eq!(search.total_requests, 21);
        assert_eq!(search.rejected_requests, 1);
        // refused admission returned its global token
        assert_eq!(stats.global.tokens, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_bucket_caps_all_categories() {
        let limiter = UpstreamRateLimiter::new(BucketConfig::new(1.0, 3));
        assert!(limiter.try_acquire(EndpointCategory::Search).await);
        assert!(limiter.try_acquire(EndpointCategory::Tracks).await);
        assert!(limiter.try_acquire(EndpointCategory::Artists).await);
        assert!(!limiter.try_acquire(EndpointCategory::Playlists).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = UpstreamRateLimiter::default();
        for _ in 0..5 {
            assert!(limiter.try_acquire(EndpointCategory::UserData).await);
        }

        let start = Instant::now();
        assert!(limiter.acquire(EndpointCategory::UserData, Duration::from_secs(1)).await);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let limiter = UpstreamRateLimiter::with_limits(BucketConfig::new(20.0, 50), |_| {
            BucketConfig::new(0.1, 1)
        });
        assert!(limiter.try_acquire(EndpointCategory::Search).await);
        assert!(!limiter.acquire(EndpointCategory::Search, Duration::from_millis(500)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_retries_quota_errors_then_succeeds() {
        let limiter = UpstreamRateLimiter::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };

        let counter = attempts.clone();
        let start = Instant::now();
        let result = limiter
            .rate_limited_call(EndpointCategory::Recommendations, &policy, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AppError::QuotaExceeded {
                            message: "429".to_string(),
                            retry_after: None,
                        })
                    } else {
                        Ok("tracks")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "tracks");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 1s then 2s of exponential backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_returns_final_errors_immediately() {
        let limiter = UpstreamRateLimiter::default();
        let attempts = AtomicU32::new(0);

        let result: AppResult<()> = limiter
            .rate_limited_call(EndpointCategory::Tracks, &RetryPolicy::default(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::ExternalApi("404 Not Found".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(AppError::ExternalApi(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_exhausts_retries_with_last_error() {
        let limiter = UpstreamRateLimiter::default();
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };

        let result: AppResult<()> = limiter
            .rate_limited_call(EndpointCategory::Artists, &policy, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err(AppError::UpstreamUnavailable(format!("503 attempt {}", n))) }
            })
            .await;

        match result {
            Err(AppError::UpstreamUnavailable(msg)) => assert_eq!(msg, "503 attempt 2"),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_fails_when_admission_times_out() {
        let limiter = UpstreamRateLimiter::with_limits(BucketConfig::new(20.0, 50), |_| {
            BucketConfig::new(0.01, 1)
        });
        let policy = RetryPolicy {
            acquire_timeout: Duration::from_millis(200),
            ..RetryPolicy::default()
        };
        assert!(limiter.try_acquire(EndpointCategory::Search).await);

        let result = limiter
            .rate_limited_call(EndpointCategory::Search, &policy, || async { Ok(1) })
            .await;
        assert!(matches!(result, Err(AppError::RateLimitTimeout(_))));
    }
}
