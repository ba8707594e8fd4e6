//! Admission middleware for embedding Bulwark in front of arbitrary routes.

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use super::handlers::verdict_response;
use crate::service::Bulwark;

pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Gate a request through Bulwark.
///
/// The body is buffered (up to `server.max_body_bytes`) for inspection and
/// handed on intact. Rejected requests never reach `next`.
pub async fn admission_middleware(
    State(bulwark): State<Arc<Bulwark>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let limit = bulwark.config().server.max_body_bytes;
    let bytes = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(error = %err, "Request body rejected");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let verdict = bulwark
        .admit(&parts.headers, peer, parts.uri.path(), bytes.to_vec())
        .await;

    if !verdict.allowed {
        return verdict_response(verdict);
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(REMAINING_HEADER, HeaderValue::from(verdict.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(verdict.reset_at.timestamp()));
    response
}
