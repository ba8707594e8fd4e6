//! Anti-spam rule definitions.
//!
//! Rules are a declarative list bound to a stable [`SpamPattern`]. Payload
//! signatures are compiled once; the `regex` engine matches in linear time,
//! so a hostile body cannot trigger catastrophic backtracking.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::check_duration_secs;
use crate::error::{BulwarkError, Result};

/// Built-in payload signatures: `(name, pattern)`.
const DEFAULT_SIGNATURES: &[(&str, &str)] = &[
    ("script_tag", r"(?i)<\s*/?\s*script\b"),
    ("javascript_uri", r"(?i)javascript\s*:"),
    (
        "inline_event_handler",
        r"(?i)\bon(?:load|error|click|dblclick|mouseover|mouseout|focus|blur|submit|change|keydown|keyup|input)\s*=",
    ),
    ("union_select", r"(?i)\bunion\s+(?:all\s+)?select\b"),
    ("drop_table", r"(?i)\bdrop\s+table\b"),
    ("quoted_tautology", r#"(?i)['"]\s*or\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#),
    ("numeric_tautology", r"(?i)\bor\s+1\s*=\s*1\b"),
];

/// Stable identifier of the rule that matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpamPattern {
    SuspiciousAgent,
    MaliciousPayload,
    RapidBurst,
    RepeatedFailure,
}

impl SpamPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpamPattern::SuspiciousAgent => "suspicious_agent",
            SpamPattern::MaliciousPayload => "malicious_payload",
            SpamPattern::RapidBurst => "rapid_burst",
            SpamPattern::RepeatedFailure => "repeated_failure",
        }
    }
}

impl std::fmt::Display for SpamPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, compiled payload signature.
#[derive(Debug, Clone)]
pub struct PayloadSignature {
    pub name: String,
    pub regex: Regex,
}

impl PayloadSignature {
    pub fn new(name: &str, pattern: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            regex: Regex::new(pattern)?,
        })
    }
}

/// One heuristic rule with its thresholds and penalty.
#[derive(Debug, Clone)]
pub enum AntiSpamRule {
    /// Case-insensitive substring match on the user agent.
    SuspiciousAgent {
        deny_list: Vec<String>,
        penalty: Duration,
    },
    /// Any signature matching the raw body.
    MaliciousPayload {
        signatures: Vec<PayloadSignature>,
        penalty: Duration,
    },
    /// `threshold` requests from one IP inside `window`.
    RapidBurst {
        threshold: u32,
        window: Duration,
        penalty: Duration,
    },
    /// `threshold` reported failures from one IP inside `window`.
    RepeatedFailure {
        threshold: u32,
        window: Duration,
        penalty: Duration,
    },
}

impl AntiSpamRule {
    pub fn pattern(&self) -> SpamPattern {
        match self {
            AntiSpamRule::SuspiciousAgent { .. } => SpamPattern::SuspiciousAgent,
            AntiSpamRule::MaliciousPayload { .. } => SpamPattern::MaliciousPayload,
            AntiSpamRule::RapidBurst { .. } => SpamPattern::RapidBurst,
            AntiSpamRule::RepeatedFailure { .. } => SpamPattern::RepeatedFailure,
        }
    }

    pub fn penalty(&self) -> Duration {
        match self {
            AntiSpamRule::SuspiciousAgent { penalty, .. }
            | AntiSpamRule::MaliciousPayload { penalty, .. }
            | AntiSpamRule::RapidBurst { penalty, .. }
            | AntiSpamRule::RepeatedFailure { penalty, .. } => *penalty,
        }
    }

    /// The deny-list entry found in `user_agent`, for agent rules.
    pub fn match_agent(&self, user_agent: &str) -> Option<&str> {
        let AntiSpamRule::SuspiciousAgent { deny_list, .. } = self else {
            return None;
        };
        let agent = user_agent.to_ascii_lowercase();
        deny_list
            .iter()
            .find(|needle| agent.contains(needle.as_str()))
            .map(String::as_str)
    }

    /// The name of the first signature found in `body`, for payload rules.
    pub fn match_payload(&self, body: &str) -> Option<&str> {
        let AntiSpamRule::MaliciousPayload { signatures, .. } = self else {
            return None;
        };
        signatures
            .iter()
            .find(|signature| signature.regex.is_match(body))
            .map(|signature| signature.name.as_str())
    }
}

/// An additional operator-supplied payload signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    pub name: String,
    pub pattern: String,
}

/// Anti-spam configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiSpamConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Substrings that mark a user agent as automated
    #[serde(default = "default_agent_deny_list")]
    pub agent_deny_list: Vec<String>,
    #[serde(default = "default_agent_penalty")]
    pub agent_penalty_secs: u64,

    #[serde(default)]
    pub extra_signatures: Vec<SignatureConfig>,
    #[serde(default = "default_payload_penalty")]
    pub payload_penalty_secs: u64,

    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u32,
    #[serde(default = "default_burst_window")]
    pub burst_window_secs: u64,
    #[serde(default = "default_burst_penalty")]
    pub burst_penalty_secs: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,
    #[serde(default = "default_failure_penalty")]
    pub failure_penalty_secs: u64,
}

impl Default for AntiSpamConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            agent_deny_list: default_agent_deny_list(),
            agent_penalty_secs: default_agent_penalty(),
            extra_signatures: Vec::new(),
            payload_penalty_secs: default_payload_penalty(),
            burst_threshold: default_burst_threshold(),
            burst_window_secs: default_burst_window(),
            burst_penalty_secs: default_burst_penalty(),
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window(),
            failure_penalty_secs: default_failure_penalty(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_agent_deny_list() -> Vec<String> {
    ["bot", "crawler", "spider", "scraper", "curl", "wget", "python-requests"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_agent_penalty() -> u64 {
    1800
}

fn default_payload_penalty() -> u64 {
    3600
}

fn default_burst_threshold() -> u32 {
    10
}

fn default_burst_window() -> u64 {
    10
}

fn default_burst_penalty() -> u64 {
    600
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> u64 {
    300
}

fn default_failure_penalty() -> u64 {
    900
}

impl AntiSpamConfig {
    pub fn validate(&self) -> Result<()> {
        self.build_rules().map(|_| ())
    }

    /// Compile the configuration into rules, in evaluation order.
    pub fn build_rules(&self) -> Result<Vec<AntiSpamRule>> {
        if self.burst_threshold == 0 || self.burst_window_secs == 0 {
            return Err(BulwarkError::Config(
                "anti_spam: burst threshold and window must be positive".into(),
            ));
        }
        if self.failure_threshold == 0 || self.failure_window_secs == 0 {
            return Err(BulwarkError::Config(
                "anti_spam: failure threshold and window must be positive".into(),
            ));
        }
        for (name, secs) in [
            ("anti_spam.agent_penalty_secs", self.agent_penalty_secs),
            ("anti_spam.payload_penalty_secs", self.payload_penalty_secs),
            ("anti_spam.burst_window_secs", self.burst_window_secs),
            ("anti_spam.burst_penalty_secs", self.burst_penalty_secs),
            ("anti_spam.failure_window_secs", self.failure_window_secs),
            ("anti_spam.failure_penalty_secs", self.failure_penalty_secs),
        ] {
            check_duration_secs(name, secs)?;
        }

        let deny_list = self
            .agent_deny_list
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let mut signatures = DEFAULT_SIGNATURES
            .iter()
            .map(|(name, pattern)| PayloadSignature::new(name, pattern))
            .collect::<Result<Vec<_>>>()?;
        for extra in &self.extra_signatures {
            let signature = PayloadSignature::new(&extra.name, &extra.pattern).map_err(|e| {
                BulwarkError::Config(format!("anti_spam signature {:?}: {}", extra.name, e))
            })?;
            signatures.push(signature);
        }

        Ok(vec![
            AntiSpamRule::SuspiciousAgent {
                deny_list,
                penalty: Duration::from_secs(self.agent_penalty_secs),
            },
            AntiSpamRule::MaliciousPayload {
                signatures,
                penalty: Duration::from_secs(self.payload_penalty_secs),
            },
            AntiSpamRule::RapidBurst {
                threshold: self.burst_threshold,
                window: Duration::from_secs(self.burst_window_secs),
                penalty: Duration::from_secs(self.burst_penalty_secs),
            },
            AntiSpamRule::RepeatedFailure {
                threshold: self.failure_threshold,
                window: Duration::from_secs(self.failure_window_secs),
                penalty: Duration::from_secs(self.failure_penalty_secs),
            },
        ])
    }
}
