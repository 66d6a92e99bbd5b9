//! HTTP routes served behind the rate limiter.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use tracing::error;

use super::interceptor::{rate_limit_middleware, ClientIdentity, RateLimitState};
use crate::ratelimit::RateLimiter;

const REQUEST_TIME_HEADER: &str = "x-request-time";

/// Build the service router with every route behind the rate limiter.
pub fn router(limiter: Arc<RateLimiter>, check_timeout: Duration) -> Router {
    let rate_limit = RateLimitState::new(Arc::clone(&limiter), check_timeout);

    Router::new()
        .route("/health", get(health))
        .route("/api/data", get(get_data).post(create_data))
        .route("/api/rate-limit/status", get(rate_limit_status))
        .route("/api/rate-limit/reset", post(reset_rate_limit))
        .layer(middleware::from_fn_with_state(rate_limit, rate_limit_middleware))
        .with_state(limiter)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "message": "Rate limiter is working"
    }))
}

fn request_time(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_TIME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn get_data(headers: HeaderMap) -> impl IntoResponse {
    Json(json!({
        "message": "This is protected data",
        "timestamp": request_time(&headers)
    }))
}

async fn create_data(headers: HeaderMap) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(json!({
            "message": "Data created successfully",
            "timestamp": request_time(&headers)
        })),
    )
}

async fn rate_limit_status(
    State(limiter): State<Arc<RateLimiter>>,
    client: ClientIdentity,
) -> Response {
    match limiter
        .get_remaining_requests(&client.ip, client.token.as_deref())
        .await
    {
        Ok(remaining) => Json(json!({
            "ip": client.ip,
            "has_token": client.token.is_some(),
            "remaining_requests": remaining
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read rate limit status");
            internal_error("Failed to get rate limit status")
        }
    }
}

async fn reset_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    client: ClientIdentity,
) -> Response {
    match limiter.reset(&client.ip, client.token.as_deref()).await {
        Ok(()) => Json(json!({ "message": "Rate limit reset successfully" })).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to reset rate limit");
            internal_error("Failed to reset rate limit")
        }
    }
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}
