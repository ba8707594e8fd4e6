//! Concurrent counter store.

use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::counter::{Admission, CounterEntry, StoreError};
use super::penalty::Escalation;
use super::rules::StrategyConfig;
use super::scope::ScopeKey;
use super::verdict::{Verdict, ViolationType};

/// Block created by the request that exceeded a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedPenalty {
    pub until: Instant,
    pub duration: Duration,
    pub violations: u32,
}

/// Outcome of [`CounterStore::check_and_increment`].
#[derive(Debug, Clone)]
pub struct CounterDecision {
    pub verdict: Verdict,
    /// Set when this call blocked the key
    pub penalty: Option<AppliedPenalty>,
    /// Violations recorded against the key so far
    pub violations: u32,
    /// The store grew past its capacity with this call
    pub over_capacity: bool,
}

/// A scope key and its violation count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolatorStat {
    pub scope_key: ScopeKey,
    pub violations: u32,
}

/// Keyed fixed-window counters.
///
/// Mutation of a single key happens under its DashMap shard lock, so
/// concurrent requests on one key are serialized while unrelated keys in
/// other shards proceed in parallel.
pub struct CounterStore {
    entries: DashMap<ScopeKey, CounterEntry>,
    escalation: Escalation,
    capacity: usize,
}

impl CounterStore {
    pub fn new(escalation: Escalation, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            escalation,
            capacity,
        }
    }

    /// Count one request for `key` and decide whether it is admitted.
    pub fn check_and_increment(
        &self,
        key: &ScopeKey,
        strategy: &StrategyConfig,
    ) -> Result<CounterDecision, StoreError> {
        let mut inserted = false;

        let result = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
                inserted = true;
                CounterEntry::new(Instant::now())
            });
            // Read the clock under the lock so it never precedes the entry's own timestamps.
            let now = Instant::now();
            entry
                .admit(now, strategy, &self.escalation)
                .map(|admission| (admission, entry.violations, now))
        };

        let (admission, violations, now) = match result {
            Ok(outcome) => outcome,
            Err(detail) => {
                self.entries.remove(key);
                return Err(StoreError::CorruptEntry {
                    key: key.to_string_key(),
                    detail,
                });
            }
        };

        let over_capacity = inserted && self.entries.len() > self.capacity;

        let (verdict, penalty) = match admission {
            Admission::Allowed { remaining, reset_at } => {
                trace!(key = %key, remaining, "Request counted");
                (Verdict::allow(remaining, reset_at, now), None)
            }
            Admission::Blocked {
                until,
                violations,
                penalty,
            } => {
                debug!(key = %key, violations, "Rate limit exceeded");
                let applied = penalty.map(|duration| AppliedPenalty {
                    until,
                    duration,
                    violations,
                });
                (
                    Verdict::deny(ViolationType::RateLimit, "Rate limit exceeded", until, now),
                    applied,
                )
            }
        };

        Ok(CounterDecision {
            verdict,
            penalty,
            violations,
            over_capacity,
        })
    }

    /// Record a violation on an existing entry without touching its count.
    ///
    /// Returns the key's violation total including this one.
    pub fn note_violation(&self, key: &ScopeKey) -> u32 {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.violations = entry.violations.saturating_add(1);
                entry.violations
            }
            None => 1,
        }
    }

    /// Copy of the entry for a key.
    pub fn get(&self, key: &ScopeKey) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Point-in-time list of keys with their last activity.
    pub fn snapshot(&self) -> Vec<(ScopeKey, Instant)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_seen))
            .collect()
    }

    /// Clear an expired block flag on one entry.
    pub fn clear_expired_block(&self, key: &ScopeKey, now: Instant) -> bool {
        self.entries
            .get_mut(key)
            .map(|mut entry| entry.clear_expired_block(now))
            .unwrap_or(false)
    }

    /// Delete an entry idle for longer than `retention`.
    pub fn remove_stale(&self, key: &ScopeKey, now: Instant, retention: Duration) -> bool {
        self.entries
            .remove_if(key, |_, entry| {
                now.saturating_duration_since(entry.last_seen) > retention
            })
            .is_some()
    }

    /// Delete an entry unless it has been touched since `seen`.
    pub fn evict(&self, key: &ScopeKey, seen: Instant) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.last_seen <= seen)
            .is_some()
    }

    /// Keys with the most recorded violations.
    pub fn top_violators(&self, limit: usize) -> Vec<ViolatorStat> {
        let mut violators: Vec<ViolatorStat> = self
            .entries
            .iter()
            .filter(|entry| entry.value().violations > 0)
            .map(|entry| ViolatorStat {
                scope_key: entry.key().clone(),
                violations: entry.value().violations,
            })
            .collect();
        violators.sort_by(|a, b| {
            b.violations
                .cmp(&a.violations)
                .then_with(|| a.scope_key.to_string_key().cmp(&b.scope_key.to_string_key()))
        });
        violators.truncate(limit);
        violators
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: ScopeKey, entry: CounterEntry) {
        self.entries.insert(key, entry);
    }
}
