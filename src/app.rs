//! Component wiring shared by the binary and the integration tests

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    config::Config,
    db::{Cache, CacheStore, CacheWriterHandle},
    routes::AppState,
    services::{
        candidates::CandidateAggregator,
        catalog::{CatalogSettings, CatalogSource, HttpCatalogClient, StaticTokenProvider},
        feedback::{FeedbackIngestor, FeedbackProcessor, FeedbackWorkerHandle},
        history::{HistoryService, HistoryStore, MemoryHistoryStore, PgHistoryStore},
        learning::{LearningEngine, MemoryLearningStore, MemorySnapshotStore, PgSnapshotStore, SnapshotStore},
        profiles::{MemoryProfileStore, PgProfileStore, ProfileStore},
        rate_limit::{UpstreamRateLimiter, UserRateLimiter},
        recommendations::RecommendationService,
        scoring::ScoringEngine,
    },
};

/// Durable stores behind the collaborator traits
#[derive(Clone)]
pub struct Persistence {
    pub profiles: Arc<dyn ProfileStore>,
    pub history: Arc<dyn HistoryStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl Persistence {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            profiles: Arc::new(PgProfileStore::new(pool.clone())),
            history: Arc::new(PgHistoryStore::new(pool.clone())),
            snapshots: Arc::new(PgSnapshotStore::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_stores(
            Arc::new(MemoryProfileStore::new()),
            Arc::new(MemoryHistoryStore::new()),
        )
    }

    /// In-memory snapshots around caller-provided profile and history stores
    pub fn with_stores(profiles: Arc<dyn ProfileStore>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            profiles,
            history,
            snapshots: Arc::new(MemorySnapshotStore::new()),
        }
    }
}

/// Background workers that must be drained on shutdown
pub struct BackgroundTasks {
    pub cache_writer: CacheWriterHandle,
    pub feedback_worker: FeedbackWorkerHandle,
    pub learning: LearningEngine,
}

impl BackgroundTasks {
    /// Drains queued feedback, persists learning state, then flushes the cache
    pub async fn shutdown(self) {
        self.feedback_worker.shutdown().await;
        self.learning.persist_all().await;
        self.cache_writer.shutdown().await;
    }
}

/// The catalog client described by the configuration
pub fn http_catalog(
    config: &Config,
    limiter: Arc<UpstreamRateLimiter>,
    cache: Cache,
) -> Arc<dyn CatalogSource> {
    let settings = CatalogSettings {
        api_url: config.catalog_api_url.clone(),
        market: config.catalog_market.clone(),
        popular_playlist_id: config.catalog_popular_playlist_id.clone(),
        retry: config.retry_policy(),
        daily_budget: config.upstream_daily_budget,
    };
    let tokens = Arc::new(StaticTokenProvider::new(config.catalog_access_token.clone()));
    Arc::new(HttpCatalogClient::new(settings, tokens, limiter, cache))
}

/// Builds handler state and its background workers
///
/// `make_catalog` receives the shared cache and upstream limiter so the
/// catalog can gate and cache its calls.
pub fn build<F>(
    config: &Config,
    cache_store: Arc<dyn CacheStore>,
    persistence: Persistence,
    make_catalog: F,
) -> (AppState, BackgroundTasks)
where
    F: FnOnce(Arc<UpstreamRateLimiter>, Cache) -> Arc<dyn CatalogSource>,
{
    let (cache, cache_writer) = Cache::new(cache_store, config.cache_ttls());
    let upstream_limiter = Arc::new(UpstreamRateLimiter::new(config.global_bucket()));
    let catalog = make_catalog(upstream_limiter.clone(), cache.clone());

    let learning = LearningEngine::new(
        config.learning(),
        Arc::new(MemoryLearningStore::new()),
        persistence.snapshots.clone(),
    );

    let history = HistoryService::new(persistence.history.clone(), catalog.clone(), cache.clone());
    let aggregator = CandidateAggregator::new(catalog.clone(), cache.clone(), config.request_timeout());
    let recommendations = RecommendationService::new(
        persistence.profiles.clone(),
        history,
        aggregator,
        ScoringEngine::new(config.rl_blend()),
        learning.clone(),
        cache.clone(),
        config.candidate_target,
        config.random_seed,
    );

    let processor = FeedbackProcessor::new(
        catalog,
        persistence.profiles.clone(),
        learning.clone(),
        cache.clone(),
    );
    let (feedback, feedback_worker) = FeedbackIngestor::new(config.feedback_queue_capacity, processor);

    let state = AppState {
        recommendations,
        feedback,
        learning: learning.clone(),
        upstream_limiter,
        user_limiter: UserRateLimiter::per_minute(cache.clone(), config.user_requests_per_minute),
        cache,
        daily_budget: config.upstream_daily_budget,
    };

    (
        state,
        BackgroundTasks {
            cache_writer,
            feedback_worker,
            learning,
        },
    )
}
