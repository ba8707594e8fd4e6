//! Strategy configuration and endpoint override matching.
//!
//! Every scope type has one strategy. Endpoints only get a strategy when an
//! override matches the request path; overrides may be exact paths or
//! prefixes ending in `*`, and the most specific match wins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::scope::ScopeType;
use crate::config::check_duration_secs;
use crate::error::{BulwarkError, Result};

/// A fixed-window strategy: `max_requests` per `window`, then a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Window length in seconds
    pub window_secs: u64,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Base block duration in seconds, escalated on repeat offences
    pub block_duration_secs: u64,
}

impl StrategyConfig {
    pub fn new(window: Duration, max_requests: u32, block_duration: Duration) -> Self {
        Self {
            window_secs: window.as_secs(),
            max_requests,
            block_duration_secs: block_duration.as_secs(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_secs == 0 {
            return Err(BulwarkError::Config(format!("{}: window_secs must be positive", name)));
        }
        if self.max_requests == 0 {
            return Err(BulwarkError::Config(format!("{}: max_requests must be positive", name)));
        }
        if self.block_duration_secs == 0 {
            return Err(BulwarkError::Config(format!(
                "{}: block_duration_secs must be positive",
                name
            )));
        }
        check_duration_secs(&format!("{}.window_secs", name), self.window_secs)?;
        check_duration_secs(&format!("{}.block_duration_secs", name), self.block_duration_secs)
    }
}

/// A per-endpoint override. Unset fields fall back to `endpoint_defaults`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOverride {
    /// Exact path, or a prefix ending in `*`
    pub path: String,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub max_requests: Option<u32>,
    #[serde(default)]
    pub block_duration_secs: Option<u64>,
}

impl EndpointOverride {
    fn resolve(&self, defaults: &StrategyConfig) -> StrategyConfig {
        StrategyConfig {
            window_secs: self.window_secs.unwrap_or(defaults.window_secs),
            max_requests: self.max_requests.unwrap_or(defaults.max_requests),
            block_duration_secs: self.block_duration_secs.unwrap_or(defaults.block_duration_secs),
        }
    }
}

/// Strategies for every scope type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_global")]
    pub global: StrategyConfig,
    #[serde(default = "default_ip")]
    pub ip: StrategyConfig,
    #[serde(default = "default_user")]
    pub user: StrategyConfig,
    #[serde(default = "default_endpoint")]
    pub endpoint_defaults: StrategyConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointOverride>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global: default_global(),
            ip: default_ip(),
            user: default_user(),
            endpoint_defaults: default_endpoint(),
            endpoints: Vec::new(),
        }
    }
}

fn default_global() -> StrategyConfig {
    StrategyConfig {
        window_secs: 60,
        max_requests: 10_000,
        block_duration_secs: 60,
    }
}

fn default_ip() -> StrategyConfig {
    StrategyConfig {
        window_secs: 60,
        max_requests: 100,
        block_duration_secs: 300,
    }
}

fn default_user() -> StrategyConfig {
    StrategyConfig {
        window_secs: 60,
        max_requests: 300,
        block_duration_secs: 300,
    }
}

fn default_endpoint() -> StrategyConfig {
    StrategyConfig {
        window_secs: 60,
        max_requests: 30,
        block_duration_secs: 600,
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<()> {
        self.global.validate("limits.global")?;
        self.ip.validate("limits.ip")?;
        self.user.validate("limits.user")?;
        self.endpoint_defaults.validate("limits.endpoint_defaults")?;

        for endpoint in &self.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(BulwarkError::Config(format!(
                    "limits.endpoints: path {:?} must start with '/'",
                    endpoint.path
                )));
            }
            endpoint
                .resolve(&self.endpoint_defaults)
                .validate(&format!("limits.endpoints[{}]", endpoint.path))?;
        }
        Ok(())
    }

    /// Longest window across every strategy and override.
    pub fn longest_window(&self) -> Duration {
        [&self.global, &self.ip, &self.user, &self.endpoint_defaults]
            .into_iter()
            .map(StrategyConfig::window)
            .chain(
                self.endpoints
                    .iter()
                    .map(|e| e.resolve(&self.endpoint_defaults).window()),
            )
            .max()
            .unwrap_or_default()
    }

    /// Every configured block duration, for checks against the penalty cap.
    pub fn block_durations(&self) -> Vec<Duration> {
        let mut durations = vec![
            self.global.block_duration(),
            self.ip.block_duration(),
            self.user.block_duration(),
        ];
        durations.extend(
            self.endpoints
                .iter()
                .map(|e| e.resolve(&self.endpoint_defaults).block_duration()),
        );
        durations
    }
}

/// Resolved strategy lookup table.
#[derive(Debug, Clone)]
pub struct StrategyTable {
    global: StrategyConfig,
    ip: StrategyConfig,
    user: StrategyConfig,
    exact: HashMap<String, StrategyConfig>,
    /// Prefix overrides, longest prefix first
    prefixes: Vec<(String, StrategyConfig)>,
}

impl StrategyTable {
    pub fn new(config: &LimitsConfig) -> Self {
        let mut exact = HashMap::new();
        let mut prefixes = Vec::new();

        for endpoint in &config.endpoints {
            let strategy = endpoint.resolve(&config.endpoint_defaults);
            match endpoint.path.strip_suffix('*') {
                Some(prefix) => prefixes.push((prefix.to_string(), strategy)),
                None => {
                    exact.insert(endpoint.path.clone(), strategy);
                }
            }
        }
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            global: config.global.clone(),
            ip: config.ip.clone(),
            user: config.user.clone(),
            exact,
            prefixes,
        }
    }

    /// Strategy for a non-endpoint scope.
    pub fn for_scope(&self, scope: ScopeType) -> Option<&StrategyConfig> {
        match scope {
            ScopeType::Global => Some(&self.global),
            ScopeType::Ip => Some(&self.ip),
            ScopeType::User => Some(&self.user),
            ScopeType::Endpoint => None,
        }
    }

    /// Find the override for a request path.
    ///
    /// Returns the matched pattern (used as the endpoint part of the scope
    /// key) alongside its strategy. Exact matches beat prefixes.
    pub fn endpoint(&self, path: &str) -> Option<(String, &StrategyConfig)> {
        if let Some(strategy) = self.exact.get(path) {
            return Some((path.to_string(), strategy));
        }

        self.prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(prefix, strategy)| (format!("{}*", prefix), strategy))
    }
}
