//! Exercises the commit worker's real `run()` loop (periodic ticks plus a
//! final shutdown flush) under paused tokio time, and the store's shared
//! cached-gate refresher.

use std::sync::Arc;
use std::time::Duration;

use vsa::cell::GateMode;
use vsa::{
    CellConfig, CommitWorker, FixedSeed, InMemoryPersister, ManualClock, Persister, StoreConfig,
    VsaStore, WorkerConfig,
};

#[tokio::test(start_paused = true)]
async fn run_loop_drains_on_shutdown() {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(VsaStore::new(
        StoreConfig {
            cell_config: CellConfig::default(),
            cache_refresh_interval: None,
        },
        Arc::new(FixedSeed(0)),
        Arc::clone(&clock),
    ));
    let cell = store.get_or_create("k").await.unwrap();
    cell.update(42, Duration::ZERO);

    let persister = Arc::new(InMemoryPersister::new());
    let worker = Arc::new(CommitWorker::new(
        Arc::clone(&store),
        persister.clone() as Arc<dyn Persister>,
        WorkerConfig {
            // High enough that the periodic ticks alone never fire a
            // commit; only the shutdown-time final flush should drain it.
            commit_threshold: 1_000_000,
            commit_interval: Duration::from_millis(10),
            eviction_interval: Duration::from_secs(3600),
            ..WorkerConfig::default()
        },
        clock,
    ));

    let run_handle = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    tokio::time::advance(Duration::from_millis(35)).await;
    assert_eq!(persister.scalar("k"), 0, "threshold never crossed by periodic ticks");

    worker.request_shutdown();
    run_handle.await.unwrap();

    assert_eq!(persister.scalar("k"), -42, "final flush must drain non-zero cells");
    assert_eq!(cell.state().1, 0);
}

#[tokio::test(start_paused = true)]
async fn cached_gate_refresher_keeps_cache_conservative() {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(VsaStore::new(
        StoreConfig {
            cell_config: CellConfig {
                gate_mode: GateMode::Cached { slack: 2 },
                ..CellConfig::default()
            },
            cache_refresh_interval: Some(Duration::from_millis(5)),
        },
        Arc::new(FixedSeed(100)),
        clock,
    ));
    store.start_cache_refresher();

    let cell = store.get_or_create("k").await.unwrap();
    assert!(cell.try_consume(50, Duration::ZERO));

    // Let the refresher observe the consumption.
    tokio::time::advance(Duration::from_millis(20)).await;

    // Real availability is 50; cached gate must never admit beyond it.
    assert!(!cell.try_consume(49, Duration::ZERO));
    assert!(cell.try_consume(40, Duration::ZERO));

    store.close().await;
}
