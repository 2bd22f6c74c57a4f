//! The key-indexed store: maps opaque string keys to [`VsaCell`]s, creates
//! on demand, and evicts idle cells.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cell::{CellConfig, VsaCell};
use crate::clock::Clock;
use crate::error::{VsaError, VsaResult};

/// Produces the initial scalar for a key on first reference. May block on
/// external storage; a failed seed is never cached, so the next
/// `get_or_create` for the same key retries.
#[async_trait]
pub trait Seeder: Send + Sync {
    async fn seed(&self, key: &str) -> Result<i64, VsaError>;
}

/// A seeder that always returns a fixed default scalar.
pub struct FixedSeed(pub i64);

#[async_trait]
impl Seeder for FixedSeed {
    async fn seed(&self, _key: &str) -> Result<i64, VsaError> {
        Ok(self.0)
    }
}

/// Store-wide configuration.
pub struct StoreConfig {
    pub cell_config: CellConfig,
    /// How often the shared cached-gate refresher sweeps resident cells.
    /// `None` disables the refresher (appropriate unless any cell uses
    /// `GateMode::Cached`).
    pub cache_refresh_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cell_config: CellConfig::default(),
            cache_refresh_interval: None,
        }
    }
}

/// Maps opaque keys to VSA cells with at-most-one creation per key.
pub struct VsaStore<C: Clock> {
    cells: DashMap<String, Arc<VsaCell>>,
    config: StoreConfig,
    seeder: Arc<dyn Seeder>,
    clock: Arc<C>,
    refresher_shutdown: Arc<Notify>,
    refresher_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<C: Clock + 'static> VsaStore<C> {
    pub fn new(config: StoreConfig, seeder: Arc<dyn Seeder>, clock: Arc<C>) -> Self {
        Self {
            cells: DashMap::new(),
            config,
            seeder,
            clock,
            refresher_shutdown: Arc::new(Notify::new()),
            refresher_handle: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the unique cell for `key`, creating it (and seeding its
    /// initial scalar) atomically on first reference.
    pub async fn get_or_create(self: &Arc<Self>, key: &str) -> VsaResult<Arc<VsaCell>> {
        if let Some(cell) = self.cells.get(key) {
            return Ok(Arc::clone(&cell));
        }

        // Seed before inserting, so a failed seed is never cached: only a
        // successfully-seeded cell ever enters the map. Races between
        // concurrent first-references resolve via DashMap's entry API,
        // which holds the shard lock for the whole closure.
        let seeded = self
            .seeder
            .seed(key)
            .await
            .map_err(|e| VsaError::SeedFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let cell = match self.cells.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => Arc::clone(e.get()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let cell = Arc::new(VsaCell::new(key, seeded, self.config.cell_config));
                e.insert(Arc::clone(&cell));
                debug!("vsa store created cell key={key}");
                cell
            }
        };
        Ok(cell)
    }

    /// Visits every currently resident cell. New entries created
    /// concurrently may or may not be observed; every entry present at the
    /// start of iteration is visited at least once (DashMap's `iter()`
    /// guarantee: each shard is locked in turn).
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<VsaCell>)) {
        for entry in self.cells.iter() {
            visitor(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Removes cells idle longer than `max_age` with no outstanding
    /// `A_net` and no commit currently in flight.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let mut evicted = 0usize;
        self.cells.retain(|key, cell| {
            let keep = !cell.is_evictable(now, max_age);
            if !keep {
                cell.close();
                debug!("vsa store evicted idle cell key={key}");
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Spawns the single shared background task that periodically
    /// refreshes every resident cell's cached-gate snapshot: one shared
    /// task for the whole store, never one per cell.
    pub fn start_cache_refresher(self: &Arc<Self>) {
        let Some(interval) = self.config.cache_refresh_interval else {
            return;
        };
        let store = Arc::clone(self);
        let shutdown = Arc::clone(&self.refresher_shutdown);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.for_each(|cell| cell.refresh_cached_gate());
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
        *self.refresher_handle.lock().unwrap() = Some(handle);
    }

    /// Stops the cache refresher (if running) and closes every resident
    /// cell. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.refresher_shutdown.notify_one();
        if let Some(handle) = self.refresher_handle.lock().unwrap().take() {
            let _ = handle.await;
        }
        self.for_each(|cell| cell.close());
    }
}
