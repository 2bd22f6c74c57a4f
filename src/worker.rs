//! The commit worker: periodically scans resident cells, extracts net
//! deltas that meet a threshold or age deadline, and drives the
//! extract → persist → reconcile cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::error::PersisterError;
use crate::metrics;
use crate::persister::{CommitRow, Persister};
use crate::store::VsaStore;

/// Tuning for the commit worker's scan/flush/evict cadence.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// High-water mark: a cell is proposed for commit once `|A_net| >=
    /// commit_threshold`.
    pub commit_threshold: i64,
    /// How often the worker scans resident cells.
    pub commit_interval: Duration,
    /// Idle-flush deadline: a cell with non-zero `A_net` untouched for at
    /// least this long is force-flushed even below `commit_threshold`.
    /// `None` disables age-based flushing.
    pub commit_max_age: Option<Duration>,
    /// Idle-eviction deadline passed to `store.evict_idle`.
    pub eviction_age: Duration,
    /// How often the worker runs an eviction pass.
    pub eviction_interval: Duration,
    /// Hysteresis low watermark: after a commit, a cell is skipped until
    /// `|A_net|` falls back below this value. `0` disables hysteresis.
    pub commit_low_watermark: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            commit_threshold: 0,
            commit_interval: Duration::from_millis(100),
            commit_max_age: None,
            eviction_age: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(60),
            commit_low_watermark: 0,
        }
    }
}

/// Plain atomic counters, read via [`WorkerStats::snapshot`], mirrored live
/// into the `metrics` facade at the point each event occurs.
#[derive(Debug, Default)]
pub struct WorkerStats {
    rows_committed: AtomicU64,
    rows_failed: AtomicU64,
    batches_sent: AtomicU64,
    fatal_failures: AtomicU64,
    cells_evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStatsSnapshot {
    pub rows_committed: u64,
    pub rows_failed: u64,
    pub batches_sent: u64,
    pub fatal_failures: u64,
    pub cells_evicted: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            rows_committed: self.rows_committed.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            fatal_failures: self.fatal_failures.load(Ordering::Relaxed),
            cells_evicted: self.cells_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Drives the extract/commit cycle for a [`VsaStore`]. A single logical
/// task: cells are never scanned concurrently by two workers.
pub struct CommitWorker<C: Clock> {
    store: Arc<VsaStore<C>>,
    persister: Arc<dyn Persister>,
    config: WorkerConfig,
    clock: Arc<C>,
    stats: Arc<WorkerStats>,
    shutdown: Arc<Notify>,
}

impl<C: Clock + 'static> CommitWorker<C> {
    pub fn new(
        store: Arc<VsaStore<C>>,
        persister: Arc<dyn Persister>,
        config: WorkerConfig,
        clock: Arc<C>,
    ) -> Self {
        Self {
            store,
            persister,
            config,
            clock,
            stats: Arc::new(WorkerStats::default()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Signals the run loop to stop after its next final flush.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Runs the scan/commit/evict loop until `request_shutdown` is called,
    /// then performs one final scan that commits every cell with non-zero
    /// `A_net` before returning.
    pub async fn run(&self) {
        let mut commit_ticker = tokio::time::interval(self.config.commit_interval);
        let mut evict_ticker = tokio::time::interval(self.config.eviction_interval);
        loop {
            tokio::select! {
                _ = commit_ticker.tick() => {
                    self.scan_and_commit(false).await;
                }
                _ = evict_ticker.tick() => {
                    self.run_eviction();
                }
                _ = self.shutdown.notified() => break,
            }
        }
        self.scan_and_commit(true).await;
    }

    fn run_eviction(&self) {
        let evicted = self.store.evict_idle(self.config.eviction_age);
        if evicted > 0 {
            self.stats.cells_evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::record_cells_evicted(evicted as u64);
            debug!("vsa worker evicted {evicted} idle cells");
        }
        metrics::record_resident_cells(self.store.len());
    }

    /// One pass: builds a batch of `(key, v)` rows, invokes
    /// the persister, and reconciles on success. `force` (used only for
    /// the shutdown flush) bypasses the threshold, age deadline, and
    /// hysteresis so every outstanding cell is proposed.
    async fn scan_and_commit(&self, force: bool) {
        let now = self.clock.now();
        let threshold = if force { 0 } else { self.config.commit_threshold };

        let mut rows = Vec::new();
        let mut cells = Vec::new();

        self.store.for_each(|cell| {
            if cell.is_closed() {
                return;
            }
            cell.clear_armed_low_if_below(self.config.commit_low_watermark);

            let (mut should, mut v) = cell.check_commit(threshold);
            if !should && !force {
                if let Some(max_age) = self.config.commit_max_age {
                    let (_, net) = cell.state();
                    if net != 0 && cell.idle_for(now) >= max_age {
                        should = true;
                        v = net;
                    }
                }
            }
            if !should {
                return;
            }
            if !force && self.config.commit_low_watermark > 0 && cell.is_armed_low() {
                return;
            }
            if v == 0 {
                return;
            }
            if cell.begin_commit() {
                rows.push(CommitRow { key: cell.key().to_string(), delta: v });
                cells.push(Arc::clone(cell));
            }
        });

        if rows.is_empty() {
            return;
        }

        metrics::record_batch_sent(rows.len());
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);

        match self.persister.commit_batch(&rows).await {
            Ok(()) => {
                for (row, cell) in rows.iter().zip(cells.iter()) {
                    // A racing refund may have shrunk |A_net| since this
                    // row's check_commit; commit() tolerates that as long
                    // as the magnitude still fits, so this is safe to
                    // ignore rather than propagate.
                    let _ = cell.commit(row.delta, now);
                    cell.end_commit();
                }
                self.stats.rows_committed.fetch_add(rows.len() as u64, Ordering::Relaxed);
                metrics::record_rows_committed(rows.len() as u64);
                debug!("vsa worker committed batch of {} rows", rows.len());
            }
            Err(e) => {
                for cell in &cells {
                    cell.end_commit();
                }
                self.stats.rows_failed.fetch_add(rows.len() as u64, Ordering::Relaxed);
                metrics::record_rows_failed(rows.len() as u64);
                match e {
                    PersisterError::Retryable(msg) => {
                        warn!("vsa worker batch of {} rows failed, will retry: {msg}", rows.len());
                    }
                    PersisterError::Fatal(msg) => {
                        self.stats.fatal_failures.fetch_add(1, Ordering::Relaxed);
                        error!("vsa worker batch of {} rows failed fatally: {msg}", rows.len());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellConfig;
    use crate::clock::ManualClock;
    use crate::persister::{FailingPersister, InMemoryPersister};
    use crate::store::{FixedSeed, StoreConfig, VsaStore};

    fn make_store(clock: Arc<ManualClock>) -> Arc<VsaStore<ManualClock>> {
        Arc::new(VsaStore::new(
            StoreConfig {
                cell_config: CellConfig::default(),
                cache_refresh_interval: None,
            },
            Arc::new(FixedSeed(0)),
            clock,
        ))
    }

    #[tokio::test]
    async fn write_reduction_scenario() {
        let clock = Arc::new(ManualClock::new());
        let store = make_store(Arc::clone(&clock));
        let cell = store.get_or_create("k").await.unwrap();
        for _ in 0..500 {
            cell.update(1, Duration::ZERO);
        }

        let persister = Arc::new(InMemoryPersister::new());
        let worker = CommitWorker::new(
            Arc::clone(&store),
            persister.clone() as Arc<dyn Persister>,
            WorkerConfig {
                commit_threshold: 50,
                ..WorkerConfig::default()
            },
            clock,
        );

        // Drain everything in one forced pass, matching the worker's
        // shutdown-time behavior, to measure total rows/persisted value
        // without depending on wall-clock ticking.
        worker.scan_and_commit(true).await;

        assert_eq!(persister.scalar("k"), -500);
        assert_eq!(worker.stats().snapshot().batches_sent, 1);
    }

    #[tokio::test]
    async fn threshold_gates_commit_until_crossed() {
        let clock = Arc::new(ManualClock::new());
        let store = make_store(Arc::clone(&clock));
        let cell = store.get_or_create("k").await.unwrap();
        cell.update(10, Duration::ZERO);

        let persister = Arc::new(InMemoryPersister::new());
        let worker = CommitWorker::new(
            Arc::clone(&store),
            persister.clone() as Arc<dyn Persister>,
            WorkerConfig {
                commit_threshold: 50,
                ..WorkerConfig::default()
            },
            clock,
        );

        worker.scan_and_commit(false).await;
        assert_eq!(persister.scalar("k"), 0);
        assert_eq!(cell.state().1, 10);

        cell.update(45, Duration::ZERO);
        worker.scan_and_commit(false).await;
        assert_eq!(persister.scalar("k"), -55);
        assert_eq!(cell.state().1, 0);
    }

    #[tokio::test]
    async fn persister_failure_leaves_delta_uncommitted_for_retry() {
        let clock = Arc::new(ManualClock::new());
        let store = make_store(Arc::clone(&clock));
        let cell = store.get_or_create("k").await.unwrap();
        cell.update(100, Duration::ZERO);

        let persister = Arc::new(FailingPersister::new(InMemoryPersister::new(), 1));
        let worker = CommitWorker::new(
            Arc::clone(&store),
            persister as Arc<dyn Persister>,
            WorkerConfig { commit_threshold: 10, ..WorkerConfig::default() },
            clock,
        );

        worker.scan_and_commit(false).await;
        // Failure: A_net must still hold the full amount.
        assert_eq!(cell.state().1, 100);
        assert_eq!(worker.stats().snapshot().rows_failed, 1);

        worker.scan_and_commit(false).await;
        assert_eq!(cell.state().1, 0);
        assert_eq!(worker.stats().snapshot().rows_committed, 1);
    }

    #[tokio::test]
    async fn age_based_flush_forces_commit_below_threshold() {
        let clock = Arc::new(ManualClock::new());
        let store = make_store(Arc::clone(&clock));
        let cell = store.get_or_create("k").await.unwrap();
        cell.update(5, Duration::ZERO);

        let persister = Arc::new(InMemoryPersister::new());
        let worker = CommitWorker::new(
            Arc::clone(&store),
            persister.clone() as Arc<dyn Persister>,
            WorkerConfig {
                commit_threshold: 1000,
                commit_max_age: Some(Duration::from_secs(10)),
                ..WorkerConfig::default()
            },
            Arc::clone(&clock),
        );

        worker.scan_and_commit(false).await;
        assert_eq!(persister.scalar("k"), 0);

        clock.advance(Duration::from_secs(11));
        worker.scan_and_commit(false).await;
        assert_eq!(persister.scalar("k"), -5);
    }

    #[tokio::test]
    async fn shutdown_final_flush_drains_all_nonzero_cells() {
        let clock = Arc::new(ManualClock::new());
        let store = make_store(Arc::clone(&clock));
        let a = store.get_or_create("a").await.unwrap();
        let b = store.get_or_create("b").await.unwrap();
        a.update(7, Duration::ZERO);
        b.update(-3, Duration::ZERO);

        let persister = Arc::new(InMemoryPersister::new());
        let worker = CommitWorker::new(
            Arc::clone(&store),
            persister.clone() as Arc<dyn Persister>,
            WorkerConfig { commit_threshold: 1_000_000, ..WorkerConfig::default() },
            clock,
        );

        worker.scan_and_commit(true).await;
        assert_eq!(persister.scalar("a"), -7);
        assert_eq!(persister.scalar("b"), 3);
        assert_eq!(a.state().1, 0);
        assert_eq!(b.state().1, 0);
    }

    #[tokio::test]
    async fn hysteresis_skips_commit_until_net_falls_below_low_watermark() {
        let clock = Arc::new(ManualClock::new());
        let store = make_store(Arc::clone(&clock));
        let cell = store.get_or_create("k").await.unwrap();

        let persister = Arc::new(InMemoryPersister::new());
        let worker = CommitWorker::new(
            Arc::clone(&store),
            persister.clone() as Arc<dyn Persister>,
            WorkerConfig {
                commit_threshold: 10,
                commit_low_watermark: 5,
                ..WorkerConfig::default()
            },
            clock,
        );

        // Crosses the threshold with no prior commit: not armed, commits.
        cell.update(10, Duration::ZERO);
        worker.scan_and_commit(false).await;
        assert_eq!(persister.scalar("k"), -10);
        assert!(cell.is_armed_low());

        // Still above the threshold, but armed-low since the last commit
        // and |A_net| never fell below the watermark: must be skipped.
        cell.update(12, Duration::ZERO);
        worker.scan_and_commit(false).await;
        assert_eq!(persister.scalar("k"), -10, "armed-low cell must not re-commit");
        assert_eq!(cell.state().1, 12);

        // Dips below the watermark (but also below the commit threshold,
        // so nothing is proposed yet) — this clears the armed-low flag.
        cell.update(-9, Duration::ZERO);
        worker.scan_and_commit(false).await;
        assert_eq!(persister.scalar("k"), -10);
        assert!(!cell.is_armed_low());
        assert_eq!(cell.state().1, 3);

        // Crosses the threshold again while disarmed: commits normally.
        cell.update(10, Duration::ZERO);
        worker.scan_and_commit(false).await;
        assert_eq!(persister.scalar("k"), -23);
        assert_eq!(cell.state().1, 0);
    }
}
