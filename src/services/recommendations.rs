use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::timeout_at;

use crate::{
    db::{Cache, CacheKey},
    error::AppError,
    models::{ScoredRecommendation, UserProfile},
    services::{
        candidates::{CandidateAggregator, SourceReport},
        cold_start::{stage_for_age, ColdStartStage},
        history::HistoryService,
        learning::LearningEngine,
        profiles::ProfileStore,
        scoring::{ScoringEngine, ScoringWeights},
    },
};

pub const DEFAULT_MAX_RESULTS: usize = 50;
pub const MAX_RESULTS_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub candidates_ms: u64,
    pub scoring_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationMetadata {
    pub candidate_count: usize,
    pub cache_hit: bool,
    pub stage: ColdStartStage,
    pub account_age_days: Option<u32>,
    pub history_size: usize,
    pub weights: ScoringWeights,
    pub timings: StageTimings,
    #[serde(default)]
    pub sources: Vec<SourceReport>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub recommendations: Vec<ScoredRecommendation>,
    pub metadata: RecommendationMetadata,
}

/// Cached ranking together with the size it was computed for
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRecommendations {
    max_results: usize,
    response: RecommendationResponse,
}

/// Drops the user's cached ranking and marks rankings in flight as stale
pub async fn invalidate_recommendations(cache: &Cache, user_id: &str) {
    let version = CacheKey::RecommendationVersion(user_id.to_string());
    let ttl = cache.default_ttl(&version);
    if let Err(e) = cache.increment_counter(&version, 1, ttl).await {
        tracing::warn!(error = %e, user_id = %user_id, "Failed to bump recommendation version");
    }
    if let Err(e) = cache
        .delete(&CacheKey::Recommendations(user_id.to_string()))
        .await
    {
        tracing::warn!(error = %e, user_id = %user_id, "Failed to invalidate cached recommendations");
    }
}

/// Orchestrates cache lookup, candidate generation and scoring
#[derive(Clone)]
pub struct RecommendationService {
    profiles: Arc<dyn ProfileStore>,
    history: HistoryService,
    aggregator: CandidateAggregator,
    scoring: ScoringEngine,
    learning: LearningEngine,
    cache: Cache,
    candidate_target: usize,
    rng: Arc<Mutex<StdRng>>,
}

impl RecommendationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        history: HistoryService,
        aggregator: CandidateAggregator,
        scoring: ScoringEngine,
        learning: LearningEngine,
        cache: Cache,
        candidate_target: usize,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            profiles,
            history,
            aggregator,
            scoring,
            learning,
            cache,
            candidate_target,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// Per-request RNG drawn from the service stream, so a fixed seed yields
    /// a reproducible sequence of requests
    fn request_rng(&self) -> StdRng {
        let seed = match self.rng.lock() {
            Ok(mut guard) => guard.gen::<u64>(),
            Err(poisoned) => poisoned.into_inner().gen::<u64>(),
        };
        StdRng::seed_from_u64(seed)
    }

    async fn profile(&self, user_id: &str) -> UserProfile {
        match self.profiles.profile(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::debug!(user_id = %user_id, "No stored profile, using defaults");
                UserProfile::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user_id, "Failed to load profile, using defaults");
                UserProfile::default()
            }
        }
    }

    /// Feedback generation counter; a change means cached rankings are stale
    async fn version(&self, user_id: &str) -> i64 {
        match self
            .cache
            .counter(&CacheKey::RecommendationVersion(user_id.to_string()))
            .await
        {
            Ok(version) => version,
            Err(e) => {
                tracing::debug!(error = %e, user_id = %user_id, "Recommendation version unavailable");
                0
            }
        }
    }

    /// Produces a ranked list for the user
    ///
    /// Never fails: collaborator failures degrade to defaults, an empty
    /// history or a smaller pool. A cached ranking is reused when it was
    /// computed for at least `max_results` items.
    pub async fn generate_recommendations(
        &self,
        user_id: &str,
        max_results: usize,
        force_refresh: bool,
    ) -> RecommendationResponse {
        let started = Instant::now();
        let max_results = max_results.clamp(1, MAX_RESULTS_LIMIT);
        let key = CacheKey::Recommendations(user_id.to_string());

        if !force_refresh {
            if let Some(cached) = self.cache.get_from_cache::<CachedRecommendations>(&key).await {
                if cached.max_results >= max_results {
                    let mut response = cached.response;
                    response.recommendations.truncate(max_results);
                    response.metadata.cache_hit = true;
                    response.metadata.timings = StageTimings {
                        total_ms: started.elapsed().as_millis() as u64,
                        ..StageTimings::default()
                    };
                    tracing::debug!(user_id = %user_id, count = response.recommendations.len(), "Served cached recommendations");
                    return response;
                }
            }
        }

        let deadline = self.aggregator.request_deadline();
        let version = self.version(user_id).await;
        let profile = self.profile(user_id).await;
        let account_age_days = profile.account_age_days(Utc::now());
        let policy = stage_for_age(account_age_days);

        match timeout_at(deadline, self.history.refresh_if_stale(user_id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(AppError::NotFound(_))) => {
                tracing::debug!(user_id = %user_id, "No catalog account linked, keeping stored history");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, user_id = %user_id, "Listening history refresh failed");
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Listening history refresh timed out, keeping stored history");
            }
        }
        let history = self.history.history(user_id).await;

        let pool = self
            .aggregator
            .generate_candidates_until(
                deadline,
                user_id,
                &profile.personality,
                &history,
                &policy,
                self.candidate_target,
            )
            .await;
        let candidates_ms = started.elapsed().as_millis() as u64;

        let mut rng = self.request_rng();
        let rl_values = self
            .learning
            .recommendation_values(user_id, &profile.personality, &pool.tracks, &mut rng)
            .await;
        let recommendations = self.scoring.rank(
            &pool.tracks,
            &history,
            &profile.personality,
            &policy.weights,
            &rl_values,
            max_results,
        );
        let total_ms = started.elapsed().as_millis() as u64;

        let response = RecommendationResponse {
            recommendations,
            metadata: RecommendationMetadata {
                candidate_count: pool.len(),
                cache_hit: false,
                stage: policy.stage,
                account_age_days,
                history_size: history.len(),
                weights: policy.weights,
                timings: StageTimings {
                    candidates_ms,
                    scoring_ms: total_ms.saturating_sub(candidates_ms),
                    total_ms,
                },
                sources: pool.sources,
                generated_at: Utc::now(),
            },
        };

        if response.recommendations.is_empty() {
            tracing::warn!(user_id = %user_id, "No recommendations produced");
        } else if self.version(user_id).await != version {
            tracing::debug!(user_id = %user_id, "Feedback arrived during generation, not caching ranking");
        } else {
            self.cache.set_in_background(
                &key,
                &CachedRecommendations {
                    max_results,
                    response: response.clone(),
                },
            );
        }

        tracing::info!(
            user_id = %user_id,
            stage = policy.stage.as_str(),
            candidates = response.metadata.candidate_count,
            count = response.recommendations.len(),
            total_ms,
            "Generated recommendations"
        );

        response
    }
}
