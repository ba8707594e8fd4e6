//! HTTP handlers for the admission API.

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::context::AdmissionRequest;
use crate::ratelimit::Verdict;
use crate::service::Bulwark;

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Render a verdict: `200` when allowed, `429` with `Retry-After` when not.
pub fn verdict_response(verdict: Verdict) -> Response {
    if verdict.allowed {
        return (StatusCode::OK, Json(verdict)).into_response();
    }

    let retry_after = verdict.retry_after_seconds.unwrap_or(1);
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(verdict)).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// `POST /v1/check`
#[instrument(skip_all)]
pub async fn check(
    State(bulwark): State<Arc<Bulwark>>,
    Json(request): Json<AdmissionRequest>,
) -> Response {
    let client_ip = request.client_ip;
    let verdict = bulwark.check(request);
    debug!(client_ip = %client_ip, allowed = verdict.allowed, "Admission check");
    verdict_response(verdict)
}

/// `GET /admin/stats`
pub async fn stats(State(bulwark): State<Arc<Bulwark>>, headers: HeaderMap) -> Response {
    if let Err(status) = authorize_admin(&bulwark, &headers) {
        return status.into_response();
    }
    Json(bulwark.stats()).into_response()
}

/// `POST /admin/reset`
pub async fn reset(State(bulwark): State<Arc<Bulwark>>, headers: HeaderMap) -> Response {
    if let Err(status) = authorize_admin(&bulwark, &headers) {
        return status.into_response();
    }
    bulwark.reset();
    Json(serde_json::json!({ "status": "reset" })).into_response()
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Admin routes are hidden when no token is configured.
fn authorize_admin(bulwark: &Bulwark, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = bulwark.config().server.admin_token.as_deref() else {
        return Err(StatusCode::NOT_FOUND);
    };

    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented.is_some_and(|token| tokens_match(token.as_bytes(), expected.as_bytes())) {
        Ok(())
    } else {
        warn!("Admin request with missing or wrong token");
        Err(StatusCode::FORBIDDEN)
    }
}

/// Compare two tokens in time that depends only on their lengths.
fn tokens_match(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
