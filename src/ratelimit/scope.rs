//! Scope key generation and handling.

use serde::{Deserialize, Serialize, Serializer};
use std::net::IpAddr;

use super::verdict::ViolationType;

/// The kind of scope a limit or block is tracked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Global,
    Ip,
    User,
    Endpoint,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Global => "global",
            ScopeType::Ip => "ip",
            ScopeType::User => "user",
            ScopeType::Endpoint => "endpoint",
        }
    }

    /// Violation recorded on blocks created by this scope's strategy.
    pub fn violation_type(&self) -> ViolationType {
        match self {
            ScopeType::Global => ViolationType::GlobalLimit,
            ScopeType::Ip => ViolationType::IpLimit,
            ScopeType::User => ViolationType::UserLimit,
            ScopeType::Endpoint => ViolationType::EndpointLimit,
        }
    }
}

/// A key that uniquely identifies a tracked scope.
///
/// Endpoint keys carry the client identifier (user id or IP) plus the
/// endpoint pattern they were matched against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub scope: ScopeType,
    pub identifier: String,
    pub endpoint: Option<String>,
}

impl ScopeKey {
    /// The single process-wide key.
    pub fn global() -> Self {
        Self {
            scope: ScopeType::Global,
            identifier: "*".to_string(),
            endpoint: None,
        }
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self {
            scope: ScopeType::Ip,
            identifier: addr.to_string(),
            endpoint: None,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self {
            scope: ScopeType::User,
            identifier: user_id.to_string(),
            endpoint: None,
        }
    }

    pub fn endpoint(client: &str, path: &str) -> Self {
        Self {
            scope: ScopeType::Endpoint,
            identifier: client.to_string(),
            endpoint: Some(path.to_string()),
        }
    }

    /// Convert the scope key to a string representation.
    pub fn to_string_key(&self) -> String {
        match &self.endpoint {
            Some(path) => format!("{}:{}:{}", self.scope.as_str(), self.identifier, path),
            None => format!("{}:{}", self.scope.as_str(), self.identifier),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

impl Serialize for ScopeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
