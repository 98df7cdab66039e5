use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::AppError, routes::AppState, services::rate_limit::UserDecision};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

const ANONYMOUS: &str = "anonymous";

/// Caller identity: the user header, else the `/users/:user_id` path
/// segment, else a shared anonymous bucket
pub fn caller_identity(request: &Request) -> String {
    if let Some(user) = request
        .headers()
        .get(super::USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return user.to_string();
    }

    let mut segments = request.uri().path().split('/');
    while let Some(segment) = segments.next() {
        if segment == "users" {
            if let Some(user) = segments.next().filter(|s| !s.is_empty()) {
                return user.to_string();
            }
        }
    }

    ANONYMOUS.to_string()
}

fn insert_limit_headers(headers: &mut HeaderMap, decision: &UserDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
}

/// Refuses callers over their per-minute budget with 429 and `Retry-After`
pub async fn user_rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let user_id = caller_identity(&request);
    let decision = state.user_limiter.check(&user_id).await;

    if !decision.allowed {
        let retry_after_secs = decision
            .retry_after
            .map(|d| d.as_secs_f64().ceil() as u64)
            .unwrap_or(1)
            .max(1);
        tracing::warn!(user_id = %user_id, retry_after_secs, "Rejected request over user rate limit");

        let mut response = AppError::RateLimited { retry_after_secs }.into_response();
        insert_limit_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    insert_limit_headers(response.headers_mut(), &decision);
    response
}
