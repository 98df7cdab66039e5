use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::db::{Cache, CacheKey};

/// Outcome of a per-user admission check
#[derive(Debug, Clone, PartialEq)]
pub struct UserDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Set when the request was refused
    pub retry_after: Option<Duration>,
    /// Time until the current window rolls over
    pub reset_in: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRateStats {
    pub user_id: String,
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_secs: u64,
}

/// Sliding-window request limiter keyed by caller identity
///
/// Approximates a true sliding window with two fixed-window counters in the
/// cache: the current window's count plus the previous window's count
/// weighted by how much of it still overlaps. Counters expire after two
/// windows so idle identities cost nothing. Cache failures admit the request.
#[derive(Clone)]
pub struct UserRateLimiter {
    cache: Cache,
    limit: u32,
    window: Duration,
}

struct WindowEstimate {
    estimate: f64,
    reset_in: Duration,
}

impl UserRateLimiter {
    pub fn new(cache: Cache, limit: u32, window: Duration) -> Self {
        Self {
            cache,
            limit,
            window: window.max(Duration::from_millis(1)),
        }
    }

    pub fn per_minute(cache: Cache, limit: u32) -> Self {
        Self::new(cache, limit, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn window_key(user_id: &str, window: i64) -> CacheKey {
        CacheKey::UserRateWindow {
            user_id: user_id.to_string(),
            window,
        }
    }

    async fn estimate(&self, user_id: &str, now_ms: i64) -> Option<WindowEstimate> {
        let window_ms = self.window.as_millis() as i64;
        let window_index = now_ms.div_euclid(window_ms);
        let into_window = now_ms.rem_euclid(window_ms);
        let overlap = 1.0 - into_window as f64 / window_ms as f64;

        let previous = self
            .cache
            .counter(&Self::window_key(user_id, window_index - 1))
            .await;
        let current = self
            .cache
            .counter(&Self::window_key(user_id, window_index))
            .await;

        match (previous, current) {
            (Ok(previous), Ok(current)) => Some(WindowEstimate {
                estimate: previous as f64 * overlap + current as f64,
                reset_in: Duration::from_millis((window_ms - into_window) as u64),
            }),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, user_id = %user_id, "User rate usage lookup failed");
                None
            }
        }
    }

    pub async fn check(&self, user_id: &str) -> UserDecision {
        self.check_at(user_id, Utc::now().timestamp_millis()).await
    }

    /// Admission check at an explicit wall-clock time in milliseconds
    ///
    /// The request is counted before the decision and taken back out of the
    /// count when refused.
    pub async fn check_at(&self, user_id: &str, now_ms: i64) -> UserDecision {
        let window_ms = self.window.as_millis() as i64;
        let window_index = now_ms.div_euclid(window_ms);
        let into_window = now_ms.rem_euclid(window_ms);
        let overlap = 1.0 - into_window as f64 / window_ms as f64;
        let reset_in = Duration::from_millis((window_ms - into_window) as u64);
        let ttl = self.window.saturating_mul(2);

        let key = Self::window_key(user_id, window_index);
        let current = match self.cache.increment_counter(&key, 1, ttl).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user_id, "User rate limit lookup failed, admitting request");
                return UserDecision {
                    allowed: true,
                    limit: self.limit,
                    remaining: self.limit,
                    retry_after: None,
                    reset_in: self.window,
                };
            }
        };

        let previous = match self
            .cache
            .counter(&Self::window_key(user_id, window_index - 1))
            .await
        {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user_id, "Previous rate window unavailable, counting current window only");
                0
            }
        };

        let estimate = previous as f64 * overlap + current as f64;
        if estimate > self.limit as f64 {
            if let Err(e) = self.cache.increment_counter(&key, -1, ttl).await {
                tracing::warn!(error = %e, user_id = %user_id, "Failed to roll back refused request");
            }
            tracing::debug!(user_id = %user_id, estimate, "User rate limit exceeded");
            return UserDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                retry_after: Some(reset_in.max(Duration::from_secs(1))),
                reset_in,
            };
        }

        UserDecision {
            allowed: true,
            limit: self.limit,
            remaining: self.limit.saturating_sub(estimate.ceil() as u32),
            retry_after: None,
            reset_in,
        }
    }

    pub async fn usage(&self, user_id: &str) -> UserRateStats {
        self.usage_at(user_id, Utc::now().timestamp_millis()).await
    }

    pub async fn usage_at(&self, user_id: &str, now_ms: i64) -> UserRateStats {
        let (current, reset_in) = match self.estimate(user_id, now_ms).await {
            Some(window) => (window.estimate.ceil() as u32, window.reset_in),
            None => (0, self.window),
        };

        UserRateStats {
            user_id: user_id.to_string(),
            current,
            limit: self.limit,
            remaining: self.limit.saturating_sub(current),
            reset_in_secs: reset_in.as_secs(),
        }
    }
}
