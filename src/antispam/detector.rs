//! Heuristic request inspection.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::rules::{AntiSpamConfig, AntiSpamRule, SpamPattern};
use crate::context::RequestContext;
use crate::error::Result;

/// A positive anti-spam match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpamVerdict {
    pub reason: String,
    pub penalty: Duration,
    pub pattern: SpamPattern,
}

/// Short fixed-window tally used for burst and failure tracking.
#[derive(Debug, Clone, Copy)]
struct WindowTally {
    count: u32,
    window_start: Instant,
}

impl WindowTally {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn roll(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.window_start) >= window {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }
}

/// Evaluates requests against the anti-spam rules, first match wins.
pub struct SpamDetector {
    enabled: bool,
    rules: Vec<AntiSpamRule>,
    bursts: DashMap<IpAddr, WindowTally>,
    failures: DashMap<IpAddr, WindowTally>,
}

impl SpamDetector {
    pub fn new(config: &AntiSpamConfig) -> Result<Self> {
        Ok(Self {
            enabled: config.enabled,
            rules: config.build_rules()?,
            bursts: DashMap::new(),
            failures: DashMap::new(),
        })
    }

    /// Inspect a request. Returns the first matching rule's verdict.
    pub fn inspect(&self, request: &RequestContext) -> Option<SpamVerdict> {
        if !self.enabled {
            return None;
        }

        let verdict = self.rules.iter().find_map(|rule| self.evaluate(rule, request));
        match &verdict {
            Some(v) => debug!(
                client_ip = %request.client_ip,
                pattern = %v.pattern,
                "Anti-spam rule matched"
            ),
            None => trace!(client_ip = %request.client_ip, "Anti-spam inspection passed"),
        }
        verdict
    }

    /// Record a failed operation (e.g. a rejected login) for an IP.
    pub fn record_failure(&self, ip: IpAddr) -> u32 {
        let window = self.failure_window();
        let mut tally = self
            .failures
            .entry(ip)
            .or_insert_with(|| WindowTally::new(Instant::now()));
        let now = Instant::now();
        tally.roll(now, window);
        tally.count = tally.count.saturating_add(1);
        tally.count
    }

    fn evaluate(&self, rule: &AntiSpamRule, request: &RequestContext) -> Option<SpamVerdict> {
        let reason = match rule {
            AntiSpamRule::SuspiciousAgent { .. } => rule
                .match_agent(&request.user_agent)
                .map(|needle| format!("Suspicious user agent ({})", needle)),
            AntiSpamRule::MaliciousPayload { .. } => {
                let body = String::from_utf8_lossy(&request.body);
                rule.match_payload(&body)
                    .map(|name| format!("Malicious payload detected ({})", name))
            }
            AntiSpamRule::RapidBurst {
                threshold, window, ..
            } => self
                .burst_exceeded(request.client_ip, *threshold, *window)
                .then(|| "Request burst detected".to_string()),
            AntiSpamRule::RepeatedFailure {
                threshold, window, ..
            } => self
                .failures_exceeded(request.client_ip, *threshold, *window)
                .then(|| "Too many failed attempts".to_string()),
        };

        reason.map(|reason| SpamVerdict {
            reason,
            penalty: rule.penalty(),
            pattern: rule.pattern(),
        })
    }

    fn burst_exceeded(&self, ip: IpAddr, threshold: u32, window: Duration) -> bool {
        let exceeded = {
            let mut tally = self
                .bursts
                .entry(ip)
                .or_insert_with(|| WindowTally::new(Instant::now()));
            let now = Instant::now();
            tally.roll(now, window);
            tally.count = tally.count.saturating_add(1);
            tally.count >= threshold
        };
        if exceeded {
            self.bursts.remove(&ip);
        }
        exceeded
    }

    fn failures_exceeded(&self, ip: IpAddr, threshold: u32, window: Duration) -> bool {
        let now = Instant::now();
        self.failures
            .remove_if(&ip, |_, tally| {
                !tally.expired(now, window) && tally.count >= threshold
            })
            .is_some()
    }

    fn burst_window(&self) -> Duration {
        self.rule_window(SpamPattern::RapidBurst)
    }

    fn failure_window(&self) -> Duration {
        self.rule_window(SpamPattern::RepeatedFailure)
    }

    fn rule_window(&self, pattern: SpamPattern) -> Duration {
        self.rules
            .iter()
            .find_map(|rule| match rule {
                AntiSpamRule::RapidBurst { window, .. }
                | AntiSpamRule::RepeatedFailure { window, .. }
                    if rule.pattern() == pattern =>
                {
                    Some(*window)
                }
                _ => None,
            })
            .unwrap_or(Duration::ZERO)
    }

    /// Drop burst and failure tallies whose window has elapsed.
    pub fn sweep(&self, now: Instant) -> usize {
        let burst_window = self.burst_window();
        let failure_window = self.failure_window();

        let stale_bursts: Vec<IpAddr> = self
            .bursts
            .iter()
            .filter(|t| t.value().expired(now, burst_window))
            .map(|t| *t.key())
            .collect();
        let stale_failures: Vec<IpAddr> = self
            .failures
            .iter()
            .filter(|t| t.value().expired(now, failure_window))
            .map(|t| *t.key())
            .collect();

        let bursts = stale_bursts
            .iter()
            .filter(|ip| {
                self.bursts
                    .remove_if(ip, |_, t| t.expired(now, burst_window))
                    .is_some()
            })
            .count();
        let failures = stale_failures
            .iter()
            .filter(|ip| {
                self.failures
                    .remove_if(ip, |_, t| t.expired(now, failure_window))
                    .is_some()
            })
            .count();
        bursts + failures
    }

    /// Number of IPs with live burst or failure tallies.
    pub fn tracker_count(&self) -> usize {
        self.bursts.len() + self.failures.len()
    }

    pub fn reset(&self) {
        self.bursts.clear();
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(config: AntiSpamConfig) -> SpamDetector {
        SpamDetector::new(&config).unwrap()
    }

    fn request(ip: &str) -> RequestContext {
        RequestContext::new(ip.parse().unwrap(), "Mozilla/5.0", "/api/items")
    }

    #[tokio::test]
    async fn test_clean_request_passes() {
        let detector = detector(AntiSpamConfig::default());
        assert!(detector.inspect(&request("1.2.3.4")).is_none());
    }

    #[tokio::test]
    async fn test_agent_rule_wins_over_payload() {
        let detector = detector(AntiSpamConfig::default());
        let req = RequestContext::new("1.2.3.4".parse().unwrap(), "curl/8.0", "/")
            .with_body("<script>alert(1)</script>");

        let verdict = detector.inspect(&req).unwrap();
        assert_eq!(verdict.pattern, SpamPattern::SuspiciousAgent);
        assert_eq!(verdict.penalty, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_payload_rule() {
        let detector = detector(AntiSpamConfig::default());
        let req = request("1.2.3.4").with_body("comment=<script>alert(1)</script>");

        let verdict = detector.inspect(&req).unwrap();
        assert_eq!(verdict.pattern, SpamPattern::MaliciousPayload);
        assert_eq!(verdict.penalty, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_padded_payload_still_matches() {
        let detector = detector(AntiSpamConfig::default());
        let body = format!("{}<script>alert(1)</script>", "a".repeat(70_000));

        let verdict = detector.inspect(&request("1.2.3.4").with_body(body)).unwrap();
        assert_eq!(verdict.pattern, SpamPattern::MaliciousPayload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_burst() {
        let detector = detector(AntiSpamConfig {
            burst_threshold: 5,
            burst_window_secs: 10,
            ..Default::default()
        });
        let req = request("7.7.7.7");

        for _ in 0..4 {
            assert!(detector.inspect(&req).is_none());
        }
        let verdict = detector.inspect(&req).unwrap();
        assert_eq!(verdict.pattern, SpamPattern::RapidBurst);

        // Another IP is unaffected
        assert!(detector.inspect(&request("7.7.7.8")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_window_resets() {
        let detector = detector(AntiSpamConfig {
            burst_threshold: 3,
            burst_window_secs: 10,
            ..Default::default()
        });
        let req = request("7.7.7.7");

        detector.inspect(&req);
        detector.inspect(&req);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(detector.inspect(&req).is_none());
        assert!(detector.inspect(&req).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failure() {
        let detector = detector(AntiSpamConfig {
            failure_threshold: 3,
            failure_window_secs: 60,
            ..Default::default()
        });
        let ip: IpAddr = "8.8.4.4".parse().unwrap();
        let req = request("8.8.4.4");

        detector.record_failure(ip);
        detector.record_failure(ip);
        assert!(detector.inspect(&req).is_none());

        assert_eq!(detector.record_failure(ip), 3);
        let verdict = detector.inspect(&req).unwrap();
        assert_eq!(verdict.pattern, SpamPattern::RepeatedFailure);
        assert_eq!(verdict.penalty, Duration::from_secs(900));

        // Tally consumed by the match
        assert!(detector.inspect(&req).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_do_not_count() {
        let detector = detector(AntiSpamConfig {
            failure_threshold: 2,
            failure_window_secs: 60,
            ..Default::default()
        });
        let ip: IpAddr = "8.8.4.4".parse().unwrap();

        detector.record_failure(ip);
        tokio::time::advance(Duration::from_secs(61)).await;
        detector.record_failure(ip);
        assert!(detector.inspect(&request("8.8.4.4")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired_tallies() {
        let detector = detector(AntiSpamConfig::default());
        detector.inspect(&request("1.0.0.1"));
        detector.record_failure("1.0.0.2".parse().unwrap());
        assert_eq!(detector.tracker_count(), 2);

        assert_eq!(detector.sweep(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(detector.sweep(Instant::now()), 2);
        assert_eq!(detector.tracker_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_detector() {
        let detector = detector(AntiSpamConfig {
            enabled: false,
            ..Default::default()
        });
        let req = request("1.2.3.4").with_body("<script>");
        assert!(detector.inspect(&req).is_none());
    }
}
