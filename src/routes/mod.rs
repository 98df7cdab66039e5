use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    db::Cache,
    middleware::{make_span_with_request_id, request_id_middleware, user_rate_limit_middleware},
    services::{
        feedback::FeedbackIngestor,
        learning::LearningEngine,
        rate_limit::{UpstreamRateLimiter, UserRateLimiter},
        recommendations::RecommendationService,
    },
};

pub mod feedback;
pub mod learning;
pub mod recommendations;
pub mod stats;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub recommendations: RecommendationService,
    pub feedback: FeedbackIngestor,
    pub learning: LearningEngine,
    pub upstream_limiter: Arc<UpstreamRateLimiter>,
    pub user_limiter: UserRateLimiter,
    pub cache: Cache,
    /// Upstream requests allowed per UTC day
    pub daily_budget: u64,
}

/// Creates the application router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes(state.clone()))
        .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
        .layer(from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API routes under /api/v1, all subject to the per-user limit
fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/users/:user_id/recommendations",
            get(recommendations::get_recommendations),
        )
        .route("/users/:user_id/feedback", post(feedback::submit_feedback))
        .route("/users/:user_id/learning-stats", get(learning::learning_stats))
        .route("/users/:user_id/rate-limit", get(stats::user_rate_limit))
        .route("/stats/rate-limits", get(stats::rate_limits))
        .route("/stats/cache", get(stats::cache_stats))
        .route_layer(from_fn_with_state(state, user_rate_limit_middleware))
}

/// Health check endpoint
async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}
