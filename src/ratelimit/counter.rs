//! Fixed-window counter entries.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::penalty::Escalation;
use super::rules::StrategyConfig;
use super::verdict::deadline;

/// Internal faults detected on a counter entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("corrupt counter entry for {key}: {detail}")]
    CorruptEntry { key: String, detail: &'static str },
}

/// Result of admitting one request against an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Counted; `remaining` slots left until `reset_at`.
    Allowed { remaining: u32, reset_at: Instant },
    /// Rejected. `penalty` is set when this request caused the block.
    Blocked {
        until: Instant,
        violations: u32,
        penalty: Option<Duration>,
    },
}

/// Per-key fixed-window state.
///
/// The window opens on the first request; `count` restarts at 1 once the
/// window has fully elapsed or a block has expired. `violations` survives
/// window resets and only disappears with the entry itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u32,
    pub window_start: Instant,
    pub last_seen: Instant,
    pub blocked: bool,
    pub block_until: Option<Instant>,
    pub violations: u32,
}

impl CounterEntry {
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_seen: now,
            blocked: false,
            block_until: None,
            violations: 0,
        }
    }

    /// Count one request, blocking the entry once `max_requests` is exceeded.
    pub fn admit(
        &mut self,
        now: Instant,
        strategy: &StrategyConfig,
        escalation: &Escalation,
    ) -> Result<Admission, &'static str> {
        self.check_invariants(now)?;
        self.last_seen = now;

        if self.blocked {
            match self.block_until {
                Some(until) if until > now => {
                    return Ok(Admission::Blocked {
                        until,
                        violations: self.violations,
                        penalty: None,
                    });
                }
                _ => {
                    // Block served; the key starts over with a fresh window.
                    self.clear_block();
                    self.start_window(now);
                }
            }
        }

        if now.saturating_duration_since(self.window_start) >= strategy.window() {
            self.start_window(now);
        }

        if self.count >= strategy.max_requests {
            self.violations = self.violations.saturating_add(1);
            let penalty =
                escalation.next_block_duration(strategy.block_duration(), self.violations);
            let until = deadline(now, penalty);
            self.blocked = true;
            self.block_until = Some(until);
            return Ok(Admission::Blocked {
                until,
                violations: self.violations,
                penalty: Some(penalty),
            });
        }

        self.count += 1;
        Ok(Admission::Allowed {
            remaining: strategy.max_requests - self.count,
            reset_at: deadline(self.window_start, strategy.window()),
        })
    }

    /// Clear a block whose deadline has passed and open a fresh window.
    /// Returns whether anything changed.
    pub fn clear_expired_block(&mut self, now: Instant) -> bool {
        match (self.blocked, self.block_until) {
            (true, Some(until)) if until > now => false,
            (true, _) => {
                self.clear_block();
                self.start_window(now);
                true
            }
            (false, Some(_)) => {
                self.block_until = None;
                true
            }
            (false, None) => false,
        }
    }

    fn start_window(&mut self, now: Instant) {
        self.count = 0;
        self.window_start = now;
    }

    fn clear_block(&mut self) {
        self.blocked = false;
        self.block_until = None;
    }

    fn check_invariants(&self, now: Instant) -> Result<(), &'static str> {
        if self.window_start > now {
            return Err("window starts in the future");
        }
        if self.blocked && self.block_until.is_none() {
            return Err("blocked without a deadline");
        }
        Ok(())
    }
}
