//! Registry of currently blocked scope keys.

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use super::scope::ScopeKey;
use super::verdict::ViolationType;

/// An active block on a scope key.
#[derive(Debug, Clone, Serialize)]
pub struct BlockRecord {
    pub scope_key: ScopeKey,
    #[serde(skip)]
    pub blocked_until: Instant,
    pub reason: String,
    pub violation_type: ViolationType,
    pub violation_count: u32,
}

/// Blocks are tracked independently from counters so that a key can be
/// blocked without ever having been counted.
#[derive(Default)]
pub struct BlockRegistry {
    blocks: DashMap<ScopeKey, BlockRecord>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active block for `key`, if any. Expired records are dropped on the way.
    pub fn is_blocked(&self, key: &ScopeKey, now: Instant) -> Option<BlockRecord> {
        if let Some(record) = self.blocks.get(key) {
            if record.blocked_until > now {
                return Some(record.clone());
            }
        }

        if self
            .blocks
            .remove_if(key, |_, record| record.blocked_until <= now)
            .is_some()
        {
            debug!(key = %key, "Block expired");
        }
        None
    }

    /// Block `key` until `until`. An existing longer block is kept.
    pub fn block(
        &self,
        key: ScopeKey,
        until: Instant,
        reason: impl Into<String>,
        violation_type: ViolationType,
        violation_count: u32,
    ) -> BlockRecord {
        let reason = reason.into();
        let mut record = self
            .blocks
            .entry(key.clone())
            .or_insert_with(|| BlockRecord {
                scope_key: key.clone(),
                blocked_until: until,
                reason: reason.clone(),
                violation_type,
                violation_count,
            });

        if until >= record.blocked_until {
            record.blocked_until = until;
            record.reason = reason;
            record.violation_type = violation_type;
        }
        record.violation_count = record.violation_count.max(violation_count);

        info!(
            key = %key,
            violation_type = %record.violation_type,
            violations = record.violation_count,
            "Scope key blocked"
        );
        record.clone()
    }

    /// Remove every block whose deadline has passed.
    pub fn unblock_expired(&self, now: Instant) -> usize {
        let expired: Vec<ScopeKey> = self
            .blocks
            .iter()
            .filter(|record| record.blocked_until <= now)
            .map(|record| record.key().clone())
            .collect();

        expired
            .iter()
            .filter(|key| {
                self.blocks
                    .remove_if(key, |_, record| record.blocked_until <= now)
                    .is_some()
            })
            .count()
    }

    /// Number of blocks still in force.
    pub fn active_count(&self, now: Instant) -> usize {
        self.blocks
            .iter()
            .filter(|record| record.blocked_until > now)
            .count()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&self) {
        self.blocks.clear();
    }
}
