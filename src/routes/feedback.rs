use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    models::TrackId,
    services::{
        feedback::FeedbackEvent,
        learning::{FeedbackContext, FeedbackKind},
    },
};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub track_id: String,
    pub feedback_type: FeedbackKind,
    #[serde(default)]
    pub context: FeedbackContext,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeedbackAck {
    pub acknowledged: bool,
}

/// Queues a feedback event for the learning worker
///
/// Returns 202 once queued and 503 when the queue is full.
pub async fn submit_feedback(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<FeedbackRequest>,
) -> AppResult<(StatusCode, Json<FeedbackAck>)> {
    let track_id = request.track_id.trim();
    if track_id.is_empty() {
        return Err(AppError::InvalidInput("track_id must not be empty".to_string()));
    }

    let acknowledged = state.feedback.submit(FeedbackEvent {
        user_id,
        track_id: TrackId::new(track_id),
        kind: request.feedback_type,
        context: request.context,
        received_at: Utc::now(),
    });

    let status = if acknowledged {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(FeedbackAck { acknowledged })))
}
