//! Admission verdicts returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::MAX_DURATION_SECS;

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    RateLimit,
    SpamDetection,
    IpLimit,
    UserLimit,
    EndpointLimit,
    GlobalLimit,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::RateLimit => "rate_limit",
            ViolationType::SpamDetection => "spam_detection",
            ViolationType::IpLimit => "ip_limit",
            ViolationType::UserLimit => "user_limit",
            ViolationType::EndpointLimit => "endpoint_limit",
            ViolationType::GlobalLimit => "global_limit",
        }
    }
}

impl std::fmt::Display for ViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured allow/deny decision for a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_type: Option<ViolationType>,
}

impl Verdict {
    /// An admitted request with `remaining` slots left until `reset_at`.
    pub fn allow(remaining: u32, reset_at: Instant, now: Instant) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at: wall_clock(reset_at, now),
            retry_after_seconds: None,
            reason: None,
            violation_type: None,
        }
    }

    /// An admitted request that no strategy counted against.
    pub fn bypass(now: Instant) -> Self {
        Self::allow(u32::MAX, now, now)
    }

    /// A rejected request that may retry once `until` has passed.
    pub fn deny(
        violation_type: ViolationType,
        reason: impl Into<String>,
        until: Instant,
        now: Instant,
    ) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at: wall_clock(until, now),
            retry_after_seconds: Some(retry_after_secs(until.saturating_duration_since(now))),
            reason: Some(reason.into()),
            violation_type: Some(violation_type),
        }
    }
}

/// Whole seconds a client should wait, never zero for a rejection.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

/// `now + after`, clamped to the longest configurable duration on overflow.
pub(crate) fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(Duration::from_secs(MAX_DURATION_SECS)))
        .unwrap_or(now)
}

fn wall_clock(at: Instant, now: Instant) -> DateTime<Utc> {
    let ahead = at
        .saturating_duration_since(now)
        .min(Duration::from_secs(MAX_DURATION_SECS));
    let ahead = chrono::Duration::from_std(ahead).unwrap_or(chrono::Duration::zero());
    Utc::now()
        .checked_add_signed(ahead)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_secs(300)), 300);
        assert_eq!(retry_after_secs(Duration::from_millis(299_001)), 300);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_far_deadline_does_not_overflow() {
        let now = Instant::now();
        let until = deadline(now, Duration::from_secs(u64::MAX));
        assert!(until > now);

        let verdict = Verdict::deny(ViolationType::RateLimit, "blocked", until, now);
        assert!(verdict.reset_at > Utc::now());
        assert!(verdict.retry_after_seconds.unwrap() >= MAX_DURATION_SECS);
    }

    #[test]
    fn test_deny_carries_retry_metadata() {
        let now = Instant::now();
        let verdict = Verdict::deny(
            ViolationType::RateLimit,
            "Rate limit exceeded",
            now + Duration::from_secs(300),
            now,
        );
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
        assert_eq!(verdict.retry_after_seconds, Some(300));
        assert_eq!(verdict.violation_type, Some(ViolationType::RateLimit));
    }

    #[test]
    fn test_verdict_json_shape() {
        let now = Instant::now();
        let verdict = Verdict::deny(
            ViolationType::SpamDetection,
            "blocked",
            now + Duration::from_secs(10),
            now,
        );
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["retryAfterSeconds"], 10);
        assert_eq!(json["violationType"], "spam_detection");
        assert!(json.get("resetAt").is_some());
    }
}
