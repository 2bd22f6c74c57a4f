//! The VSA cell: a concurrent accumulator separating a durable scalar `S`
//! from an uncommitted vector `A_net`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

use crate::error::{VsaError, VsaResult};
use crate::stripe::{stripe_count_for_parallelism, Chooser, StripeSet};

/// Gate strategy used by [`VsaCell::try_consume`]. All variants are
/// semantically equivalent at the admission boundary: none may admit more
/// than the strict gate would.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Always take the per-cell mutex and test the exact gate.
    Strict,
    /// Skip the mutex for an optimistic reservation when the last observed
    /// availability clears `n + guard`; the reservation is then
    /// re-validated under the same lock the strict gate uses, and rolled
    /// back if it turns out to have oversubscribed. Falls back to the
    /// strict gate outright when the guard margin is not met.
    FastPath { guard: i64 },
    /// Test against a periodically refreshed `cached_net` snapshot with a
    /// conservative `slack` margin. May reject eagerly; never admits more
    /// liberally than the strict gate.
    Cached { slack: i64 },
}

impl Default for GateMode {
    fn default() -> Self {
        GateMode::Strict
    }
}

/// Observable lifecycle state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// Created, never yet mutated.
    Fresh,
    /// At least one operation has landed.
    Active,
    /// Closed; all further operations are rejected / no-ops.
    Closed,
}

/// Configuration for a single [`VsaCell`].
#[derive(Debug, Clone, Copy)]
pub struct CellConfig {
    pub stripe_count: usize,
    pub group_count: Option<usize>,
    pub chooser: Chooser,
    pub gate_mode: GateMode,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            stripe_count: stripe_count_for_parallelism(num_cpus::get()),
            group_count: None,
            chooser: Chooser::RoundRobin,
            gate_mode: GateMode::Strict,
        }
    }
}

/// A single VSA cell: `S` (scalar) plus a striped `A_net` (vector).
pub struct VsaCell {
    key: String,
    scalar: AtomicI64,
    stripes: StripeSet,
    gate_lock: Mutex<()>,
    gate_mode: GateMode,
    cached_net: AtomicI64,
    last_mutation_millis: AtomicU64,
    armed_low: AtomicBool,
    closed: AtomicBool,
    state: AtomicU8,
    in_commit: AtomicBool,
}

const STATE_FRESH: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_CLOSED: u8 = 2;

impl VsaCell {
    /// Creates a new cell with initial scalar `initial_scalar`.
    pub fn new(key: impl Into<String>, initial_scalar: i64, config: CellConfig) -> Self {
        let key = key.into();
        debug!("vsa cell created key={key} initial_scalar={initial_scalar}");
        Self {
            key,
            scalar: AtomicI64::new(initial_scalar),
            stripes: StripeSet::new(config.stripe_count, config.group_count)
                .with_chooser(config.chooser),
            gate_lock: Mutex::new(()),
            gate_mode: config.gate_mode,
            cached_net: AtomicI64::new(0),
            last_mutation_millis: AtomicU64::new(0),
            armed_low: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: AtomicU8::new(STATE_FRESH),
            in_commit: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn touch(&self, now: Duration) {
        self.last_mutation_millis
            .store(now.as_millis() as u64, Ordering::Relaxed);
        self.state
            .compare_exchange(STATE_FRESH, STATE_ACTIVE, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    /// Observable lifecycle state.
    pub fn cell_state(&self) -> CellState {
        match self.state.load(Ordering::Relaxed) {
            STATE_FRESH => CellState::Fresh,
            STATE_ACTIVE => CellState::Active,
            _ => CellState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks this cell as having a commit in flight, so the store's
    /// eviction pass skips it. Returns `false` if a commit was already in
    /// flight (callers should not double-commit the same cell
    /// concurrently; the commit worker is a single logical task).
    pub fn begin_commit(&self) -> bool {
        !self.in_commit.swap(true, Ordering::AcqRel)
    }

    pub fn end_commit(&self) {
        self.in_commit.store(false, Ordering::Release);
    }

    /// Whether the store's eviction pass may remove this cell: idle for at
    /// least `max_age`, no commit currently in flight, and no outstanding
    /// uncommitted delta.
    pub fn is_evictable(&self, now: Duration, max_age: Duration) -> bool {
        !self.in_commit.load(Ordering::Acquire)
            && self.idle_for(now) >= max_age
            && self.stripes.net() == 0
    }

    /// How long since the cell last saw a mutating operation, relative to
    /// `now` (as produced by the same [`crate::clock::Clock`] the caller
    /// uses elsewhere).
    pub fn idle_for(&self, now: Duration) -> Duration {
        let last = Duration::from_millis(self.last_mutation_millis.load(Ordering::Relaxed));
        now.saturating_sub(last)
    }

    /// Unconditional accumulation. Never fails, never gates.
    pub fn update(&self, delta: i64, now: Duration) {
        if self.is_closed() {
            return;
        }
        self.stripes.add(delta);
        self.touch(now);
    }

    /// Admission-gated reservation. Returns `true` iff `n` was admitted.
    pub fn try_consume(&self, n: i64, now: Duration) -> bool {
        if n <= 0 {
            debug_assert!(n > 0, "try_consume requires n > 0");
            return false;
        }
        if self.is_closed() {
            return false;
        }

        match self.gate_mode {
            GateMode::Strict => self.strict_consume(n, now),
            GateMode::FastPath { guard } => {
                let s = self.scalar.load(Ordering::Acquire);
                let net = self.stripes.net();
                let available_estimate = s - net.abs();
                if available_estimate >= n.saturating_add(guard) {
                    self.fast_path_reserve(n, now)
                } else {
                    self.strict_consume(n, now)
                }
            }
            GateMode::Cached { slack } => {
                let s = self.scalar.load(Ordering::Acquire);
                let cached = self.cached_net.load(Ordering::Acquire);
                let available_estimate = s - cached.abs() - slack;
                if available_estimate >= n {
                    self.stripes.add(n);
                    self.touch(now);
                    true
                } else {
                    // May reject eagerly without falling back: never more
                    // liberal than the strict gate is required, not
                    // equally precise.
                    false
                }
            }
        }
    }

    fn strict_consume(&self, n: i64, now: Duration) -> bool {
        let _guard = self.gate_lock.lock().unwrap_or_else(|e| e.into_inner());
        let s = self.scalar.load(Ordering::Acquire);
        let net = self.stripes.net();
        let available = s - net.abs();
        if available >= n {
            let idx = self.stripes.gate_stripe_index();
            self.stripes.add_to_stripe(idx, n);
            self.touch(now);
            true
        } else {
            false
        }
    }

    /// Optimistic reservation for `GateMode::FastPath`. The guard margin
    /// only makes oversubscription *unlikely*, not impossible: any number
    /// of concurrent callers can observe the same stale estimate and all
    /// take this branch before any of their stripe writes are visible to
    /// each other. So the reservation is applied first without the lock,
    /// then re-validated one caller at a time under the same mutex the
    /// strict gate uses; whichever reservations are still oversubscribing
    /// by the time they reach the lock are rolled back there. This can
    /// reject an admission the strict gate would have accepted (if two
    /// reservations race and only one fits), but it can never admit one
    /// the strict gate would have rejected.
    fn fast_path_reserve(&self, n: i64, now: Duration) -> bool {
        let idx = self.stripes.gate_stripe_index();
        self.stripes.add_to_stripe(idx, n);
        self.touch(now);

        let _guard = self.gate_lock.lock().unwrap_or_else(|e| e.into_inner());
        let s = self.scalar.load(Ordering::Acquire);
        let net = self.stripes.net();
        if s - net.abs() >= 0 {
            true
        } else {
            self.stripes.add_to_stripe(idx, -n);
            false
        }
    }

    /// Symmetric inverse of a prior `try_consume`. Clamps so `A_net` does
    /// not cross zero into the opposite sign beyond what was actually
    /// outstanding; always returns `true` for a valid `n` on a non-closed
    /// cell (the clamped amount is not surfaced to the caller).
    pub fn try_refund(&self, n: i64, now: Duration) -> bool {
        if n <= 0 {
            debug_assert!(n > 0, "try_refund requires n > 0");
            return false;
        }
        if self.is_closed() {
            return false;
        }

        let _guard = self.gate_lock.lock().unwrap_or_else(|e| e.into_inner());
        let net = self.stripes.net();
        let delta = match net.cmp(&0) {
            std::cmp::Ordering::Greater => -n.min(net),
            std::cmp::Ordering::Less => n.min(-net),
            std::cmp::Ordering::Equal => 0,
        };
        if delta != 0 {
            let idx = self.stripes.gate_stripe_index();
            self.stripes.add_to_stripe(idx, delta);
        }
        self.touch(now);
        true
    }

    /// `S - |A_net|`.
    pub fn available(&self) -> i64 {
        let s = self.scalar.load(Ordering::Acquire);
        let net = self.stripes.net();
        s - net.abs()
    }

    /// `(S, A_net)`. The two reads are individually consistent but not
    /// jointly atomic relative to concurrent updates.
    pub fn state(&self) -> (i64, i64) {
        (self.scalar.load(Ordering::Acquire), self.stripes.net())
    }

    /// If `|A_net| >= threshold`, returns `(true, A_net)`; else `(false, 0)`.
    pub fn check_commit(&self, threshold: i64) -> (bool, i64) {
        debug_assert!(threshold >= 0, "commit threshold must be non-negative");
        let net = self.stripes.net();
        if net.abs() >= threshold {
            (true, net)
        } else {
            (false, 0)
        }
    }

    /// Moves `v` units from volatile to durable state. `v` should be a
    /// value previously returned by `check_commit` on this same cell.
    /// Idempotent for `v == 0`.
    pub fn commit(&self, v: i64, now: Duration) -> VsaResult<()> {
        if self.is_closed() {
            return Err(VsaError::Closed);
        }
        if v == 0 {
            return Ok(());
        }

        let net = self.stripes.net();
        let opposite_sign = net != 0 && v.signum() != net.signum();
        if opposite_sign && v.abs() > net.abs() {
            return Err(VsaError::InvalidArgument(format!(
                "commit magnitude {v} exceeds outstanding delta {net} for key {}",
                self.key
            )));
        }

        self.scalar.fetch_sub(v, Ordering::AcqRel);
        self.stripes.apply_commit(v);
        self.touch(now);

        // Arm unconditionally; whether hysteresis is enabled at all (and at
        // what watermark) is the worker's call, made when it reads/clears
        // this flag via `is_armed_low` / `clear_armed_low_if_below`.
        self.armed_low.store(true, Ordering::Release);

        debug!(
            "vsa cell committed key={} v={v} scalar_now={}",
            self.key,
            self.scalar.load(Ordering::Acquire)
        );
        Ok(())
    }

    /// Whether hysteresis currently forbids arming another commit for this
    /// cell (worker-driven state; see [`crate::worker::CommitWorker`]).
    /// The watermark itself lives in `WorkerConfig`, not here: this just
    /// reports whether a commit has happened since the flag was last
    /// cleared.
    pub fn is_armed_low(&self) -> bool {
        self.armed_low.load(Ordering::Acquire)
    }

    /// Clears the armed-low flag once `|A_net|` has fallen below
    /// `watermark` since the last commit. `watermark <= 0` means hysteresis
    /// is disabled and this is a no-op.
    pub fn clear_armed_low_if_below(&self, watermark: i64) {
        if watermark > 0
            && self.armed_low.load(Ordering::Acquire)
            && self.stripes.net().abs() < watermark
        {
            self.armed_low.store(false, Ordering::Release);
        }
    }

    /// Refreshes the cached-gate snapshot used by `GateMode::Cached`. Meant
    /// to be called periodically by a single shared background task owned
    /// by the store, not per-cell.
    pub fn refresh_cached_gate(&self) {
        if self.is_closed() {
            return;
        }
        self.cached_net.store(self.stripes.net(), Ordering::Relaxed);
    }

    /// Releases any cell-owned resources. Safe to call multiple times.
    /// After `close()`, `update`/`try_consume`/`try_refund` are no-ops /
    /// rejections and `commit` returns `Err(VsaError::Closed)`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.store(STATE_CLOSED, Ordering::Relaxed);
            debug!("vsa cell closed key={}", self.key);
        }
    }
}
