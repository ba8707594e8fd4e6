//! The rate limit policy engine.
//!
//! Evaluation order, first failure wins:
//! whitelist bypass, existing blocks, anti-spam, then the global, per-IP,
//! per-user (authenticated only) and per-endpoint (override only) strategies.
//!
//! The request that exceeds a strategy is rejected as `rate_limit`. The block
//! it creates is recorded under the scope's own type (`ip_limit`,
//! `user_limit` and so on), which is what later requests are rejected with.

use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::block::BlockRegistry;
use super::rules::{StrategyConfig, StrategyTable};
use super::scope::{ScopeKey, ScopeType};
use super::store::{CounterStore, ViolatorStat};
use super::verdict::{deadline, Verdict, ViolationType};
use crate::antispam::SpamDetector;
use crate::audit::{AuditEmitter, AuditEvent, AuditEventType};
use crate::config::FailMode;
use crate::context::RequestContext;

/// How long a fail-closed rejection asks the client to wait.
const FAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Number of violators listed in [`Stats`].
const TOP_VIOLATORS: usize = 10;

/// Aggregate view of limiter state for operators.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub tracked_keys: usize,
    pub active_blocks: usize,
    pub burst_trackers: usize,
    pub top_violators: Vec<ViolatorStat>,
}

/// Whitelisted IPs and roles.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    ips: HashSet<IpAddr>,
    roles: HashSet<String>,
}

impl Whitelist {
    pub fn new(
        ips: impl IntoIterator<Item = IpAddr>,
        roles: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            ips: ips.into_iter().collect(),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn contains(&self, request: &RequestContext) -> bool {
        self.ips.contains(&request.client_ip)
            || request
                .identity
                .as_ref()
                .is_some_and(|identity| self.roles.contains(&identity.role))
    }
}

/// Gates every request against blocks, anti-spam rules and strategies.
pub struct PolicyEngine {
    store: Arc<CounterStore>,
    registry: Arc<BlockRegistry>,
    detector: Arc<SpamDetector>,
    strategies: StrategyTable,
    whitelist: Whitelist,
    audit: AuditEmitter,
    fail_mode: FailMode,
    sweep_trigger: Arc<Notify>,
}

impl PolicyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CounterStore>,
        registry: Arc<BlockRegistry>,
        detector: Arc<SpamDetector>,
        strategies: StrategyTable,
        whitelist: Whitelist,
        audit: AuditEmitter,
        fail_mode: FailMode,
        sweep_trigger: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            detector,
            strategies,
            whitelist,
            audit,
            fail_mode,
            sweep_trigger,
        }
    }

    /// Decide whether a request is admitted.
    ///
    /// Never fails: every outcome, including internal faults, resolves to a
    /// verdict. Counter increments made before a later scope rejects the
    /// request are kept.
    pub fn enforce(&self, request: &RequestContext) -> Verdict {
        let now = Instant::now();

        if self.whitelist.contains(request) {
            trace!(client_ip = %request.client_ip, "Whitelisted request bypassed limits");
            return Verdict::bypass(now);
        }

        let scopes = self.scopes(request);

        for (key, _) in &scopes {
            if let Some(record) = self.registry.is_blocked(key, now) {
                debug!(key = %key, "Request from blocked scope rejected");
                self.audit.emit(AuditEvent::new(
                    AuditEventType::BlockedRequest,
                    key.clone(),
                    record.violation_type,
                    record.violation_count,
                    record.reason.clone(),
                ));
                return Verdict::deny(
                    record.violation_type,
                    "Too many requests; access temporarily blocked",
                    record.blocked_until,
                    now,
                );
            }
        }

        if let Some(spam) = self.detector.inspect(request) {
            let key = ScopeKey::ip(request.client_ip);
            let violations = self.store.note_violation(&key);
            let until = deadline(now, spam.penalty);
            self.registry.block(
                key.clone(),
                until,
                spam.reason.clone(),
                ViolationType::SpamDetection,
                violations,
            );
            self.audit.emit(AuditEvent::new(
                AuditEventType::SpamDetected,
                key,
                ViolationType::SpamDetection,
                violations,
                spam.reason.clone(),
            ));
            return Verdict::deny(ViolationType::SpamDetection, spam.reason, until, now);
        }

        let mut tightest: Option<Verdict> = None;

        for (key, strategy) in &scopes {
            let decision = match self.store.check_and_increment(key, strategy) {
                Ok(decision) => decision,
                Err(err) => {
                    error!(error = %err, fail_mode = ?self.fail_mode, "Counter store fault");
                    match self.fail_mode {
                        FailMode::Closed => {
                            return Verdict::deny(
                                ViolationType::RateLimit,
                                "Service temporarily unavailable",
                                now + FAULT_RETRY_AFTER,
                                now,
                            );
                        }
                        FailMode::Open => continue,
                    }
                }
            };

            if decision.over_capacity {
                warn!(
                    tracked = self.store.len(),
                    cap = self.store.capacity(),
                    "Counter store over capacity; requesting sweep"
                );
                self.sweep_trigger.notify_one();
            }

            if !decision.verdict.allowed {
                let violation_type = key.scope.violation_type();
                if let Some(penalty) = decision.penalty {
                    self.registry.block(
                        key.clone(),
                        penalty.until,
                        format!("{} strategy exceeded", key.scope.as_str()),
                        violation_type,
                        penalty.violations,
                    );
                    info!(
                        key = %key,
                        block_secs = penalty.duration.as_secs(),
                        violations = penalty.violations,
                        "Strategy exceeded; key blocked"
                    );
                }
                self.audit.emit(AuditEvent::new(
                    AuditEventType::RateLimitViolation,
                    key.clone(),
                    violation_type,
                    decision.violations,
                    "Rate limit exceeded",
                ));
                return decision.verdict;
            }

            let is_tighter = tightest
                .as_ref()
                .map_or(true, |current| decision.verdict.remaining < current.remaining);
            if is_tighter {
                tightest = Some(decision.verdict);
            }
        }

        tightest.unwrap_or_else(|| Verdict::bypass(now))
    }

    /// Scopes that apply to a request, in evaluation order.
    fn scopes<'a>(&'a self, request: &RequestContext) -> Vec<(ScopeKey, &'a StrategyConfig)> {
        let mut scopes = Vec::with_capacity(4);

        if let Some(strategy) = self.strategies.for_scope(ScopeType::Global) {
            scopes.push((ScopeKey::global(), strategy));
        }
        if let Some(strategy) = self.strategies.for_scope(ScopeType::Ip) {
            scopes.push((ScopeKey::ip(request.client_ip), strategy));
        }
        if let Some(identity) = &request.identity {
            if let Some(strategy) = self.strategies.for_scope(ScopeType::User) {
                scopes.push((ScopeKey::user(&identity.user_id), strategy));
            }
        }
        if let Some((pattern, strategy)) = self.strategies.endpoint(&request.endpoint_path) {
            let client = match &request.identity {
                Some(identity) => identity.user_id.clone(),
                None => request.client_ip.to_string(),
            };
            scopes.push((ScopeKey::endpoint(&client, &pattern), strategy));
        }

        scopes
    }

    /// Record a failed operation for the repeated-failure rule.
    pub fn record_failure(&self, ip: IpAddr) {
        let failures = self.detector.record_failure(ip);
        debug!(client_ip = %ip, failures, "Failure recorded");
    }

    /// Aggregate counts for operators.
    pub fn stats(&self) -> Stats {
        Stats {
            tracked_keys: self.store.len(),
            active_blocks: self.registry.active_count(Instant::now()),
            burst_trackers: self.detector.tracker_count(),
            top_violators: self.store.top_violators(TOP_VIOLATORS),
        }
    }

    /// Drop all counters, blocks and anti-spam tallies.
    pub fn reset(&self) {
        self.store.clear();
        self.registry.clear();
        self.detector.reset();
        warn!("All limiter state reset");
    }

    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }
}
