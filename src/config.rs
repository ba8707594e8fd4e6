//! Configuration management for Bulwark.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::antispam::AntiSpamConfig;
use crate::error::{BulwarkError, Result};
use crate::ratelimit::{LimitsConfig, PenaltyConfig};

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "BULWARK";

/// Longest accepted value for any `*_secs` setting: ten years.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

/// Reject a duration setting above [`MAX_DURATION_SECS`].
pub(crate) fn check_duration_secs(name: &str, secs: u64) -> Result<()> {
    if secs > MAX_DURATION_SECS {
        return Err(BulwarkError::Config(format!(
            "{} ({}) exceeds the maximum of {} seconds",
            name, secs, MAX_DURATION_SECS
        )));
    }
    Ok(())
}

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-scope strategies and endpoint overrides
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Progressive penalty settings
    #[serde(default)]
    pub penalty: PenaltyConfig,

    /// Heuristic anti-spam rules
    #[serde(default)]
    pub anti_spam: AntiSpamConfig,

    /// Trusted identities that bypass every strategy
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Background cleanup settings
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Identity provider settings
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Audit emission settings
    #[serde(default)]
    pub audit: AuditConfig,

    /// Verdict applied when counter state turns out to be corrupt
    #[serde(default)]
    pub fail_mode: FailMode,
}

/// How internal faults resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request
    Open,
    /// Reject the request
    #[default]
    Closed,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Token required by the admin endpoints. Admin routes are disabled when unset.
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Largest request body buffered for inspection
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Honour `X-Forwarded-For` / `X-Real-IP`
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_token: None,
            max_body_bytes: default_max_body_bytes(),
            trust_proxy_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Trusted IPs and roles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl WhitelistConfig {
    /// Parse the configured IPs.
    pub fn parsed_ips(&self) -> Result<Vec<IpAddr>> {
        self.ips
            .iter()
            .map(|ip| {
                ip.trim()
                    .parse::<IpAddr>()
                    .map_err(|e| BulwarkError::Config(format!("whitelist ip {:?}: {}", ip, e)))
            })
            .collect()
    }
}

/// Sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between scheduled sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Entries idle for longer than this are deleted. Must outlast the
    /// penalty cap plus the longest window, or escalation history is lost.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Soft cap on tracked counter entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            retention_secs: default_retention(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_retention() -> u64 {
    2 * 86400
}

fn default_max_entries() -> usize {
    100_000
}

/// A statically configured credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticIdentity {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// Identity provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Bearer token to identity table used by the bundled provider
    #[serde(default)]
    pub tokens: HashMap<String, StaticIdentity>,

    /// Upper bound on a single identity lookup
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
}

impl IdentityConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
            lookup_timeout_ms: default_lookup_timeout(),
        }
    }
}

fn default_lookup_timeout() -> u64 {
    250
}

/// Audit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Events buffered before new ones are dropped
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize {
    1024
}

impl BulwarkConfig {
    /// Load configuration from an optional YAML file layered under
    /// `BULWARK__*` environment overrides, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Yaml,
            ));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: BulwarkConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BulwarkConfig = serde_yaml::from_str(yaml)
            .map_err(|e| BulwarkError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configuration the subsystem cannot serve with.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        self.penalty.validate()?;
        self.anti_spam.validate()?;
        self.whitelist.parsed_ips()?;

        let cap = self.penalty.cap();
        if let Some(base) = self.limits.block_durations().into_iter().find(|d| *d > cap) {
            return Err(BulwarkError::Config(format!(
                "penalty.cap_secs ({}) is below a configured block duration ({})",
                cap.as_secs(),
                base.as_secs()
            )));
        }

        if self.sweeper.interval_secs == 0 {
            return Err(BulwarkError::Config("sweeper.interval_secs must be positive".into()));
        }
        if self.sweeper.retention_secs == 0 {
            return Err(BulwarkError::Config("sweeper.retention_secs must be positive".into()));
        }
        check_duration_secs("sweeper.interval_secs", self.sweeper.interval_secs)?;
        check_duration_secs("sweeper.retention_secs", self.sweeper.retention_secs)?;
        let floor = cap + self.limits.longest_window();
        if self.sweeper.retention() <= floor {
            return Err(BulwarkError::Config(format!(
                "sweeper.retention_secs ({}) must exceed cap plus longest window ({})",
                self.sweeper.retention_secs,
                floor.as_secs()
            )));
        }
        if self.sweeper.max_entries == 0 {
            return Err(BulwarkError::Config("sweeper.max_entries must be positive".into()));
        }
        if self.audit.channel_capacity == 0 {
            return Err(BulwarkError::Config("audit.channel_capacity must be positive".into()));
        }
        if matches!(&self.server.admin_token, Some(token) if token.is_empty()) {
            return Err(BulwarkError::Config("server.admin_token must not be empty".into()));
        }
        Ok(())
    }
}
