//! HTTP server implementation.

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers;
use crate::error::{BulwarkError, Result};
use crate::service::Bulwark;

/// Build the admission API router.
pub fn router(bulwark: Arc<Bulwark>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/check", post(handlers::check))
        .route("/admin/stats", get(handlers::stats))
        .route("/admin/reset", post(handlers::reset))
        .with_state(bulwark)
}

/// HTTP server for the admission API.
pub struct HttpServer {
    addr: SocketAddr,
    bulwark: Arc<Bulwark>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, bulwark: Arc<Bulwark>) -> Self {
        Self { addr, bulwark }
    }

    /// Serve until `signal` resolves, then finish in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        let app = router(self.bulwark);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            BulwarkError::Server(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::BulwarkConfig;
    use crate::context::StaticIdentityProvider;
    use crate::ratelimit::StrategyConfig;
    use crate::server::{admission_middleware, REMAINING_HEADER};
    use axum::body::{Body, Bytes};
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn bulwark(admin_token: Option<&str>) -> Arc<Bulwark> {
        let mut config = BulwarkConfig::default();
        config.server.admin_token = admin_token.map(str::to_string);
        config.limits.ip =
            StrategyConfig::new(Duration::from_secs(60), 2, Duration::from_secs(120));
        Arc::new(
            Bulwark::new(
                config,
                Arc::new(MemoryAuditSink::new()),
                Arc::new(StaticIdentityProvider::default()),
            )
            .unwrap(),
        )
    }

    fn check_request() -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/check")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"clientIp":"1.2.3.4","userAgent":"Mozilla/5.0","endpointPath":"/api"}"#,
            ))
            .unwrap()
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let _server = HttpServer::new(addr, bulwark(None));
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(bulwark(None))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["status"], "healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_allows_then_rejects() {
        let app = router(bulwark(None));

        for _ in 0..2 {
            let response = app.clone().oneshot(check_request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(check_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "120");
        let json = body_json(response.into_body()).await;
        assert_eq!(json["allowed"], false);
        assert_eq!(json["violationType"], "rate_limit");
        assert_eq!(json["retryAfterSeconds"], 120);
    }

    #[tokio::test]
    async fn test_admin_routes_hidden_without_token() {
        let response = router(bulwark(None))
            .oneshot(Request::get("/admin/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_token_checked() {
        let app = router(bulwark(Some("s3cret")));

        let response = app
            .clone()
            .oneshot(
                Request::get("/admin/stats")
                    .header("x-admin-token", "guess")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        app.clone().oneshot(check_request()).await.unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::get("/admin/stats")
                    .header("x-admin-token", "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["tracked_keys"], 2);

        let response = app
            .oneshot(
                Request::post("/admin/reset")
                    .header("x-admin-token", "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_middleware_forwards_body_and_sets_headers() {
        let bulwark = bulwark(None);
        let app = Router::new()
            .route("/echo", post(|body: Bytes| async move { body }))
            .layer(axum::middleware::from_fn_with_state(
                bulwark.clone(),
                admission_middleware,
            ));

        let request = || {
            Request::post("/echo")
                .header(header::USER_AGENT, "Mozilla/5.0")
                .body(Body::from("hello"))
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REMAINING_HEADER], "1");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");

        app.clone().oneshot(request()).await.unwrap();
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_middleware_rejects_malicious_body() {
        let bulwark = bulwark(None);
        let app = Router::new()
            .route("/comment", post(|| async { "stored" }))
            .layer(axum::middleware::from_fn_with_state(
                bulwark,
                admission_middleware,
            ));

        let response = app
            .oneshot(
                Request::post("/comment")
                    .header(header::USER_AGENT, "Mozilla/5.0")
                    .body(Body::from("<script>alert(1)</script>"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["violationType"], "spam_detection");
    }
}
