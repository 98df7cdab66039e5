use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::{
    error::{AppError, AppResult},
    services::recommendations::{RecommendationResponse, DEFAULT_MAX_RESULTS, MAX_RESULTS_LIMIT},
};

use super::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RecommendationQuery {
    pub max_results: Option<usize>,
    #[serde(default)]
    pub force_refresh: bool,
}

/// Handler for the recommendations endpoint
pub async fn get_recommendations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<RecommendationQuery>,
) -> AppResult<Json<RecommendationResponse>> {
    let max_results = query.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
    if !(1..=MAX_RESULTS_LIMIT).contains(&max_results) {
        return Err(AppError::InvalidInput(format!(
            "max_results must be between 1 and {}",
            MAX_RESULTS_LIMIT
        )));
    }

    let response = state
        .recommendations
        .generate_recommendations(&user_id, max_results, query.force_refresh)
        .await;
    Ok(Json(response))
}
