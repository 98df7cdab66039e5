use axum::{
    extract::{Path, State},
    Json,
};

use crate::services::learning::LearningStats;

use super::AppState;

pub async fn learning_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<LearningStats> {
    Json(state.learning.stats(&user_id).await)
}
