use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Serialize;

use crate::{
    db::{CacheKey, CacheStats},
    services::rate_limit::{RateLimiterStats, UserRateStats},
};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct DailyQuota {
    pub date: String,
    pub used: i64,
    pub budget: u64,
    pub remaining: u64,
}

#[derive(Debug, Serialize)]
pub struct RateLimitReport {
    #[serde(flatten)]
    pub buckets: RateLimiterStats,
    pub daily_quota: DailyQuota,
}

/// Upstream bucket state plus today's quota usage
pub async fn rate_limits(State(state): State<AppState>) -> Json<RateLimitReport> {
    let date = Utc::now().format("%Y-%m-%d").to_string();
    let used = match state.cache.counter(&CacheKey::QuotaUsage(date.clone())).await {
        Ok(used) => used,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read daily quota usage");
            0
        }
    };

    Json(RateLimitReport {
        buckets: state.upstream_limiter.stats(),
        daily_quota: DailyQuota {
            date,
            used,
            budget: state.daily_budget,
            remaining: state.daily_budget.saturating_sub(used.max(0) as u64),
        },
    })
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

pub async fn user_rate_limit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<UserRateStats> {
    Json(state.user_limiter.usage(&user_id).await)
}
