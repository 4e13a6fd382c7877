//! Background eviction of idle users.

use crate::store::MemoryStore;
use chrono::{DateTime, Duration, Utc};
use kanade_common::config::MemoryConfig;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Sweeper timing.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps
    pub interval: std::time::Duration,
    /// Inactivity after which a user is evicted
    pub idle_ttl: Duration,
    /// How long to wait for a busy user before skipping them this round
    pub lock_wait: std::time::Duration,
}

impl SweeperConfig {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            interval: std::time::Duration::from_secs(config.sweep_interval_secs.max(1)),
            idle_ttl: Duration::seconds(
                i64::try_from(config.idle_ttl_secs)
                    .unwrap_or(i64::MAX)
                    .min(i64::MAX / 1000),
            ),
            lock_wait: std::time::Duration::from_millis(config.sweep_lock_timeout_ms),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Periodically evicts users idle for longer than the configured TTL.
pub struct EvictionSweeper {
    store: Arc<MemoryStore>,
    config: SweeperConfig,
}

impl EvictionSweeper {
    pub fn new(store: Arc<MemoryStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    /// Run one pass at `now`.
    ///
    /// A user that cannot be evaluated is logged and skipped; the pass always
    /// covers every tracked user.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for user_id in self.store.user_ids() {
            report.scanned += 1;
            match self
                .store
                .evict_if_stale(&user_id, now, self.config.idle_ttl, self.config.lock_wait)
                .await
            {
                Ok(true) => {
                    report.evicted += 1;
                    tracing::debug!(user_id = %user_id, "Evicted idle user");
                }
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(user_id = %user_id, error = %e, "Sweep skipped user");
                }
            }
        }

        if report.evicted > 0 || report.failed > 0 {
            tracing::info!(
                scanned = report.scanned,
                evicted = report.evicted,
                failed = report.failed,
                "Eviction sweep finished"
            );
        }

        report
    }

    /// Sweep on every interval tick until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            idle_ttl_secs = self.config.idle_ttl.num_seconds(),
            "Eviction sweeper started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }

        tracing::info!("Eviction sweeper stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::Turn;
    use chrono::TimeZone;
    use std::convert::Infallible;
    use test_case::test_case;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn config(lock_wait_ms: u64) -> SweeperConfig {
        SweeperConfig {
            interval: std::time::Duration::from_secs(3600),
            idle_ttl: Duration::days(30),
            lock_wait: std::time::Duration::from_millis(lock_wait_ms),
        }
    }

    fn priming() -> Result<Vec<Turn>, Infallible> {
        Ok(vec![Turn::system("persona"), Turn::assistant("Understood.")])
    }

    #[test]
    fn test_config_from_memory_config() {
        let cfg = SweeperConfig::from_config(&MemoryConfig::default());
        assert_eq!(cfg.interval, std::time::Duration::from_secs(3600));
        assert_eq!(cfg.idle_ttl, Duration::days(30));
        assert_eq!(cfg.lock_wait, std::time::Duration::from_secs(5));
    }

    #[test_case(0, false ; "just seen")]
    #[test_case(29, false ; "one day left")]
    #[test_case(30, false ; "exactly at threshold")]
    #[test_case(31, true ; "past threshold")]
    fn test_sweep_threshold(days_idle: i64, evicted: bool) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        rt.block_on(async {
            let store = Arc::new(MemoryStore::new(20));
            store.record_activity("u1", t0()).await;

            let sweeper = EvictionSweeper::new(Arc::clone(&store), config(100));
            let report = sweeper.sweep(t0() + Duration::days(days_idle)).await;

            assert_eq!(report.scanned, 1);
            assert_eq!(report.evicted, usize::from(evicted));
            assert_eq!(store.contains("u1"), !evicted);
        });
    }

    #[tokio::test]
    async fn test_sweep_leaves_active_users_untouched() {
        let store = Arc::new(MemoryStore::new(20));
        let now = t0() + Duration::days(40);

        for (user, seen) in [("idle", t0()), ("active", now - Duration::days(1))] {
            let mut entry = store.get_or_create(user, priming).await.unwrap();
            entry.record_activity(seen);
            entry
                .append_exchange(Turn::user("hi"), Turn::assistant("hello"))
                .unwrap();
        }
        let before = store.history("active").await.unwrap();

        let sweeper = EvictionSweeper::new(Arc::clone(&store), config(100));
        let report = sweeper.sweep(now).await;

        assert_eq!(report, SweepReport { scanned: 2, evicted: 1, failed: 0 });
        assert!(!store.contains("idle"));
        assert_eq!(store.history("active").await.unwrap(), before);
        assert_eq!(store.message_count("active"), Some(1));
    }

    #[tokio::test]
    async fn test_sweep_isolates_busy_user() {
        let store = Arc::new(MemoryStore::new(20));
        store.record_activity("busy", t0()).await;
        store.record_activity("idle", t0()).await;

        let _held = store.entry("busy").await;
        let sweeper = EvictionSweeper::new(Arc::clone(&store), config(20));
        let report = sweeper.sweep(t0() + Duration::days(31)).await;

        assert_eq!(report.scanned, 2);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.failed, 1);
        assert!(store.contains("busy"));
        assert!(!store.contains("idle"));
    }

    #[tokio::test]
    async fn test_activity_during_wait_keeps_user() {
        let store = Arc::new(MemoryStore::new(20));
        store.record_activity("u1", t0()).await;
        let now = t0() + Duration::days(31);

        // An exchange holds the user; the sweeper queues behind it.
        let mut held = store.entry("u1").await;
        let sweep = {
            let sweeper = EvictionSweeper::new(Arc::clone(&store), config(2_000));
            tokio::spawn(async move { sweeper.sweep(now).await })
        };
        tokio::task::yield_now().await;

        held.record_activity(now);
        drop(held);

        let report = sweep.await.unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(store.message_count("u1"), Some(2));
    }

    #[tokio::test]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new(20));
        store
            .record_activity("ancient", Utc::now() - Duration::days(90))
            .await;

        let (tx, rx) = watch::channel(false);
        let cfg = SweeperConfig {
            interval: std::time::Duration::from_millis(10),
            ..config(100)
        };
        let handle = EvictionSweeper::new(Arc::clone(&store), cfg).spawn(rx);

        // The first tick fires immediately.
        for _ in 0..100 {
            if !store.contains("ancient") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!store.contains("ancient"));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_sender_dropped() {
        let store = Arc::new(MemoryStore::new(20));
        let (tx, rx) = watch::channel(false);
        let handle = EvictionSweeper::new(store, config(100)).spawn(rx);
        drop(tx);

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
