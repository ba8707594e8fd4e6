//! Background cleanup of counters, blocks and anti-spam tallies.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::block::BlockRegistry;
use super::scope::ScopeKey;
use super::store::CounterStore;
use crate::antispam::SpamDetector;
use crate::config::SweeperConfig;
use crate::error::{BulwarkError, Result};

/// Share of entries evicted when the store is over its cap.
const EVICTION_DIVISOR: usize = 10;

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub blocks_cleared: usize,
    pub stale_removed: usize,
    pub evicted: usize,
    pub registry_expired: usize,
    pub trackers_expired: usize,
    pub remaining: usize,
}

/// Periodic sweeper bounding limiter memory.
pub struct Sweeper {
    store: Arc<CounterStore>,
    registry: Arc<BlockRegistry>,
    detector: Arc<SpamDetector>,
    config: SweeperConfig,
    trigger: Arc<Notify>,
}

impl Sweeper {
    pub fn new(
        store: Arc<CounterStore>,
        registry: Arc<BlockRegistry>,
        detector: Arc<SpamDetector>,
        config: SweeperConfig,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            detector,
            config,
            trigger,
        }
    }

    /// Run one pass.
    ///
    /// Works from a snapshot of the keys and touches one entry at a time, so
    /// admission checks on other keys are never held up for the whole pass.
    /// Entries updated after the snapshot was taken are left alone.
    pub fn sweep(&self) -> Result<SweepReport> {
        let now = Instant::now();
        let retention = self.config.retention();
        let mut report = SweepReport::default();

        for (key, _) in self.store.snapshot() {
            if self.store.remove_stale(&key, now, retention) {
                report.stale_removed += 1;
            } else if self.store.clear_expired_block(&key, now) {
                report.blocks_cleared += 1;
            }
        }

        report.registry_expired = self.registry.unblock_expired(now);
        report.trackers_expired = self.detector.sweep(now);

        let cap = self.store.capacity();
        let len = self.store.len();
        if len > cap {
            report.evicted = self.evict_oldest(self.store.snapshot(), len, cap);
        }

        self.check_capacity(report)
    }

    /// Fail and request another pass when the store is still over its cap.
    fn check_capacity(&self, mut report: SweepReport) -> Result<SweepReport> {
        let cap = self.store.capacity();
        report.remaining = self.store.len();
        if report.remaining > cap {
            self.trigger.notify_one();
            return Err(BulwarkError::Capacity {
                len: report.remaining,
                cap,
            });
        }

        debug!(
            stale = report.stale_removed,
            cleared = report.blocks_cleared,
            evicted = report.evicted,
            remaining = report.remaining,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Evict the least recently seen entries: a tenth of the store, or
    /// enough to get back under `cap`, whichever is more. Candidates seen
    /// again since `candidates` was taken are skipped.
    fn evict_oldest(
        &self,
        mut candidates: Vec<(ScopeKey, Instant)>,
        len: usize,
        cap: usize,
    ) -> usize {
        let target = len.div_ceil(EVICTION_DIVISOR).max(len - cap);
        candidates.sort_by_key(|(_, last_seen)| *last_seen);

        let evicted = candidates
            .iter()
            .take(target)
            .filter(|(key, seen)| self.store.evict(key, *seen))
            .count();

        warn!(evicted, cap, "Counter store over capacity; evicted oldest entries");
        evicted
    }

    /// Run the sweeper until `shutdown` flips.
    ///
    /// Sweeps on the configured interval and whenever the trigger is
    /// notified. Failures are logged and never stop the loop.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = period.as_secs(), "Sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {
                        debug!("Extra sweep requested");
                    }
                    _ = shutdown.changed() => break,
                }

                if let Err(err) = self.sweep() {
                    error!(error = %err, "Sweep failed");
                }
            }
            info!("Sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antispam::AntiSpamConfig;
    use crate::ratelimit::{Escalation, StrategyConfig};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn sweeper(retention_secs: u64, max_entries: usize) -> Sweeper {
        Sweeper::new(
            Arc::new(CounterStore::new(Escalation::default(), max_entries)),
            Arc::new(BlockRegistry::new()),
            Arc::new(SpamDetector::new(&AntiSpamConfig::default()).unwrap()),
            SweeperConfig {
                interval_secs: 3600,
                retention_secs,
                max_entries,
            },
            Arc::new(Notify::new()),
        )
    }

    fn key(n: u32) -> ScopeKey {
        ScopeKey::ip(IpAddr::V4(Ipv4Addr::from(n)))
    }

    fn strategy() -> StrategyConfig {
        StrategyConfig::new(Duration::from_secs(60), 1, Duration::from_secs(300))
    }

    fn touch(sweeper: &Sweeper, key: &ScopeKey) {
        sweeper.store.check_and_increment(key, &strategy()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_removed() {
        let sweeper = sweeper(600, 100);
        touch(&sweeper, &key(1));
        tokio::time::advance(Duration::from_secs(500)).await;
        touch(&sweeper, &key(2));
        tokio::time::advance(Duration::from_secs(200)).await;

        let report = sweeper.sweep().unwrap();
        assert_eq!(report.stale_removed, 1);
        assert!(sweeper.store.get(&key(1)).is_none());
        assert!(sweeper.store.get(&key(2)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_blocks_cleared() {
        let sweeper = sweeper(86400, 100);
        let k = key(1);
        touch(&sweeper, &k);
        let decision = sweeper.store.check_and_increment(&k, &strategy()).unwrap();
        let penalty = decision.penalty.unwrap();
        sweeper.registry.block(
            k.clone(),
            penalty.until,
            "test",
            crate::ratelimit::ViolationType::IpLimit,
            penalty.violations,
        );

        tokio::time::advance(Duration::from_secs(301)).await;
        let report = sweeper.sweep().unwrap();
        assert_eq!(report.blocks_cleared, 1);
        assert_eq!(report.registry_expired, 1);

        let entry = sweeper.store.get(&k).unwrap();
        assert!(!entry.blocked);
        assert_eq!(entry.violations, 1);
        assert!(sweeper.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_cap_evicts_oldest() {
        let sweeper = sweeper(86400, 10);
        for n in 0..12 {
            touch(&sweeper, &key(n));
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let report = sweeper.sweep().unwrap();
        assert_eq!(report.evicted, 2);
        assert_eq!(report.remaining, 10);
        assert!(sweeper.store.get(&key(0)).is_none());
        assert!(sweeper.store.get(&key(1)).is_none());
        assert!(sweeper.store.get(&key(11)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_falling_short_reports_capacity() {
        let sweeper = sweeper(86400, 2);
        for n in 0..10 {
            touch(&sweeper, &key(n));
        }
        let candidates = sweeper.store.snapshot();

        // Every key is seen again before eviction runs.
        tokio::time::advance(Duration::from_secs(1)).await;
        for n in 0..10 {
            touch(&sweeper, &key(n));
        }

        assert_eq!(sweeper.evict_oldest(candidates, 10, 2), 0);
        let err = sweeper.check_capacity(SweepReport::default()).unwrap_err();
        assert!(matches!(err, BulwarkError::Capacity { len: 10, cap: 2 }));

        tokio::time::timeout(Duration::from_millis(10), sweeper.trigger.notified())
            .await
            .expect("extra sweep requested");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_is_idempotent() {
        let sweeper = sweeper(600, 10);
        for n in 0..15 {
            touch(&sweeper, &key(n));
            tokio::time::advance(Duration::from_secs(60)).await;
        }

        let first = sweeper.sweep().unwrap();
        assert!(first.stale_removed > 0);
        let mut before: Vec<String> = sweeper
            .store
            .snapshot()
            .into_iter()
            .map(|(k, _)| k.to_string_key())
            .collect();
        before.sort();

        let second = sweeper.sweep().unwrap();
        assert_eq!(second.stale_removed, 0);
        assert_eq!(second.evicted, 0);
        assert_eq!(second.blocks_cleared, 0);
        let mut after: Vec<String> = sweeper
            .store
            .snapshot()
            .into_iter()
            .map(|(k, _)| k.to_string_key())
            .collect();
        after.sort();
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_runs_on_trigger_and_stops() {
        let sweeper = Arc::new(sweeper(86400, 2));
        for n in 0..5 {
            touch(&sweeper, &key(n));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = sweeper.clone().spawn(shutdown_rx);

        sweeper.trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sweeper.store.len() <= 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
