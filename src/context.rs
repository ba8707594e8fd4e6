//! Request context extraction and identity resolution.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::StaticIdentity;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
}

/// Identity lookups that failed. All of these degrade to anonymous scoping.
#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    #[error("identity provider unreachable: {0}")]
    Unreachable(String),
    #[error("identity lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("credential not recognised")]
    InvalidCredential,
}

/// Resolves a bearer credential to an identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Identity, IdentityError>;
}

/// Token table loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    pub fn new(tokens: &HashMap<String, StaticIdentity>) -> Self {
        let tokens = tokens
            .iter()
            .map(|(token, identity)| {
                (
                    token.clone(),
                    Identity {
                        user_id: identity.user_id.clone(),
                        role: identity.role.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn resolve(&self, credential: &str) -> Result<Identity, IdentityError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or(IdentityError::InvalidCredential)
    }
}

/// Resolve a credential, falling back to anonymous on any failure.
pub async fn resolve_identity(
    provider: &dyn IdentityProvider,
    credential: Option<&str>,
    timeout: Duration,
) -> Option<Identity> {
    let credential = credential?;
    let result = match tokio::time::timeout(timeout, provider.resolve(credential)).await {
        Ok(result) => result,
        Err(_) => Err(IdentityError::Timeout(timeout)),
    };

    match result {
        Ok(identity) => Some(identity),
        Err(error) => {
            debug!(error = %error, "Identity lookup failed; using IP-only scoping");
            None
        }
    }
}

/// Everything the policy engine looks at for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: IpAddr,
    pub user_agent: String,
    pub endpoint_path: String,
    pub body: Vec<u8>,
    pub identity: Option<Identity>,
}

impl RequestContext {
    pub fn new(
        client_ip: IpAddr,
        user_agent: impl Into<String>,
        endpoint_path: impl Into<String>,
    ) -> Self {
        Self {
            client_ip,
            user_agent: user_agent.into(),
            endpoint_path: endpoint_path.into(),
            body: Vec::new(),
            identity: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    /// Build a context from HTTP request parts.
    ///
    /// With `trust_proxy` the first `X-Forwarded-For` hop wins, then
    /// `X-Real-IP`; otherwise (or if neither parses) the socket peer is used.
    /// Requests with no usable address share the unspecified address.
    pub fn from_parts(
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        path: &str,
        body: impl Into<Vec<u8>>,
        trust_proxy: bool,
    ) -> Self {
        let forwarded = if trust_proxy {
            forwarded_ip(headers)
        } else {
            None
        };
        let client_ip = forwarded
            .or(peer)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        Self::new(client_ip, user_agent, path).with_body(body)
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let from_forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    from_forwarded_for.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// The bearer credential carried in `Authorization`, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Admission check input for callers that already know the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub client_ip: IpAddr,
    #[serde(default)]
    pub user_agent: String,
    pub endpoint_path: String,
    #[serde(default)]
    pub raw_body: String,
    #[serde(default)]
    pub authenticated_user_id: Option<String>,
    #[serde(default)]
    pub user_role: Option<String>,
}

impl From<AdmissionRequest> for RequestContext {
    fn from(request: AdmissionRequest) -> Self {
        let identity = request.authenticated_user_id.map(|user_id| Identity {
            user_id,
            role: request.user_role.unwrap_or_else(|| "user".to_string()),
        });
        RequestContext::new(request.client_ip, request.user_agent, request.endpoint_path)
            .with_body(request.raw_body)
            .with_identity(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    struct UnreachableProvider;

    #[async_trait]
    impl IdentityProvider for UnreachableProvider {
        async fn resolve(&self, _credential: &str) -> Result<Identity, IdentityError> {
            Err(IdentityError::Unreachable("connection refused".into()))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl IdentityProvider for SlowProvider {
        async fn resolve(&self, _credential: &str) -> Result<Identity, IdentityError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Identity {
                user_id: "late".into(),
                role: "user".into(),
            })
        }
    }

    fn static_provider() -> StaticIdentityProvider {
        let mut tokens = HashMap::new();
        tokens.insert(
            "t0k3n".to_string(),
            StaticIdentity {
                user_id: "alice".into(),
                role: "admin".into(),
            },
        );
        StaticIdentityProvider::new(&tokens)
    }

    #[test]
    fn test_peer_address_used_without_proxy_trust() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));
        let peer: IpAddr = "10.0.0.5".parse().unwrap();

        let ctx = RequestContext::from_parts(&headers, Some(peer), "/api", Vec::new(), false);
        assert_eq!(ctx.client_ip, peer);
        assert_eq!(ctx.user_agent, "Mozilla/5.0");
        assert_eq!(ctx.endpoint_path, "/api");
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));

        let ctx = RequestContext::from_parts(&headers, None, "/", Vec::new(), true);
        assert_eq!(ctx.client_ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_real_ip_fallback_and_unspecified_default() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        let ctx = RequestContext::from_parts(&headers, None, "/", Vec::new(), true);
        assert_eq!(ctx.client_ip, "198.51.100.1".parse::<IpAddr>().unwrap());

        let ctx = RequestContext::from_parts(&HeaderMap::new(), None, "/", Vec::new(), true);
        assert_eq!(ctx.client_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(ctx.user_agent, "");
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_static_provider_resolves() {
        let provider = static_provider();
        let identity = resolve_identity(&provider, Some("t0k3n"), Duration::from_secs(1)).await;
        assert_eq!(
            identity,
            Some(Identity {
                user_id: "alice".into(),
                role: "admin".into()
            })
        );
        assert!(resolve_identity(&provider, Some("nope"), Duration::from_secs(1)).await.is_none());
        assert!(resolve_identity(&provider, None, Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_provider_degrades_to_anonymous() {
        let identity =
            resolve_identity(&UnreachableProvider, Some("t0k3n"), Duration::from_secs(1)).await;
        assert!(identity.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let identity =
            resolve_identity(&SlowProvider, Some("t0k3n"), Duration::from_millis(250)).await;
        assert!(identity.is_none());
    }

    #[test]
    fn test_admission_request_conversion() {
        let json = r#"{
            "clientIp": "1.2.3.4",
            "userAgent": "Mozilla/5.0",
            "endpointPath": "/api/items",
            "rawBody": "hello",
            "authenticatedUserId": "u1"
        }"#;
        let request: AdmissionRequest = serde_json::from_str(json).unwrap();
        let ctx = RequestContext::from(request);
        assert_eq!(ctx.body, b"hello".to_vec());
        assert_eq!(ctx.identity.unwrap().role, "user");
    }
}
