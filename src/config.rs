use std::time::Duration;

use serde::Deserialize;

use crate::db::CacheTtls;
use crate::services::learning::LearningConfig;
use crate::services::rate_limit::{BucketConfig, RetryPolicy};
use crate::services::scoring::RlBlend;

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; in-memory stores are used when unset
    #[serde(default)]
    pub database_url: Option<String>,

    /// Redis connection URL; an in-process cache is used when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Music catalog API base URL
    #[serde(default = "default_catalog_api_url")]
    pub catalog_api_url: String,

    /// Application-level catalog access token (obtained by the OAuth collaborator)
    #[serde(default)]
    pub catalog_access_token: String,

    /// Market used for catalog searches
    #[serde(default = "default_catalog_market")]
    pub catalog_market: String,

    /// Playlist used as the popular-track fallback source
    #[serde(default = "default_popular_playlist")]
    pub catalog_popular_playlist_id: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Aggregate upstream ceiling, requests per second
    #[serde(default = "default_global_rps")]
    pub upstream_global_rps: f64,

    /// Aggregate upstream burst capacity
    #[serde(default = "default_global_burst")]
    pub upstream_global_burst: u32,

    /// Daily upstream call budget used for usage warnings
    #[serde(default = "default_daily_budget")]
    pub upstream_daily_budget: u64,

    #[serde(default = "default_max_retries")]
    pub upstream_max_retries: u32,

    #[serde(default = "default_acquire_timeout_ms")]
    pub upstream_acquire_timeout_ms: u64,

    /// Requests per window allowed for a single caller identity
    #[serde(default = "default_user_rpm")]
    pub user_requests_per_minute: u32,

    #[serde(default = "default_recommendations_ttl")]
    pub cache_recommendations_ttl_secs: u64,

    #[serde(default = "default_audio_features_ttl")]
    pub cache_audio_features_ttl_secs: u64,

    #[serde(default = "default_api_ttl")]
    pub cache_api_ttl_secs: u64,

    #[serde(default = "default_user_data_ttl")]
    pub cache_user_data_ttl_secs: u64,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_initial_epsilon")]
    pub initial_epsilon: f64,

    /// Episodes between learning-state snapshots
    #[serde(default = "default_persist_every")]
    pub learning_persist_every: u64,

    /// Scale applied to the learned value before it nudges the final score
    #[serde(default = "default_rl_scale")]
    pub rl_scale: f64,

    /// Maximum absolute nudge the learned value may apply
    #[serde(default = "default_rl_band")]
    pub rl_band: f64,

    /// Target candidate pool size per request
    #[serde(default = "default_candidate_target")]
    pub candidate_target: usize,

    /// Deadline for assembling a candidate pool
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Capacity of the feedback ingestion queue
    #[serde(default = "default_feedback_queue")]
    pub feedback_queue_capacity: usize,

    /// Fixed seed for exploration and replay; random when unset
    #[serde(default)]
    pub random_seed: Option<u64>,
}

fn default_catalog_api_url() -> String {
    "https://api.spotify.com".to_string()
}

fn default_catalog_market() -> String {
    "US".to_string()
}

fn default_popular_playlist() -> String {
    "37i9dQZEVXbMDoHDwVN2tF".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_global_rps() -> f64 {
    20.0
}

fn default_global_burst() -> u32 {
    50
}

fn default_daily_budget() -> u64 {
    100_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_user_rpm() -> u32 {
    100
}

fn default_recommendations_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_audio_features_ttl() -> u64 {
    604_800 // 7 days
}

fn default_api_ttl() -> u64 {
    21_600 // 6 hours
}

fn default_user_data_ttl() -> u64 {
    1_800 // 30 minutes
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_initial_epsilon() -> f64 {
    0.1
}

fn default_persist_every() -> u64 {
    10
}

fn default_rl_scale() -> f64 {
    0.05
}

fn default_rl_band() -> f64 {
    0.05
}

fn default_candidate_target() -> usize {
    300
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_feedback_queue() -> usize {
    1_024
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }

    pub fn global_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.upstream_global_rps, self.upstream_global_burst)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.upstream_max_retries,
            acquire_timeout: Duration::from_millis(self.upstream_acquire_timeout_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn cache_ttls(&self) -> CacheTtls {
        CacheTtls {
            recommendations: Duration::from_secs(self.cache_recommendations_ttl_secs),
            audio_features: Duration::from_secs(self.cache_audio_features_ttl_secs),
            api_responses: Duration::from_secs(self.cache_api_ttl_secs),
            user_data: Duration::from_secs(self.cache_user_data_ttl_secs),
        }
    }

    pub fn learning(&self) -> LearningConfig {
        LearningConfig {
            learning_rate: self.learning_rate,
            initial_epsilon: self.initial_epsilon,
            persist_every: self.learning_persist_every,
            seed: self.random_seed,
            ..LearningConfig::default()
        }
    }

    pub fn rl_blend(&self) -> RlBlend {
        RlBlend {
            scale: self.rl_scale,
            band: self.rl_band,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
