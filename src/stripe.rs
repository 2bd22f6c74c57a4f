//! Striped atomic representation of the vector `A_net = sum(stripes) -
//! committed_offset`, plus the stripe-chooser variants.

use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Minimum number of stripes (a power of two in `[8, 128]`).
pub const MIN_STRIPES: usize = 8;
/// Maximum number of stripes.
pub const MAX_STRIPES: usize = 128;

/// Pads `T` to (at least) a 128-byte boundary to prevent false sharing
/// between adjacent stripes, group subtotals, or the scalar/offset pair.
///
/// 128 bytes (rather than the strict 64-byte cache line size) is used
/// because modern Intel/AMD prefetchers pull adjacent cache-line pairs,
/// which can still induce false sharing at a 64-byte stride.
#[repr(align(128))]
#[derive(Debug, Default)]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

/// Rounds `n` up to the next power of two, clamped to `[MIN_STRIPES,
/// MAX_STRIPES]`.
pub fn stripe_count_for_parallelism(p: usize) -> usize {
    let target = (2 * p.max(1)).next_power_of_two();
    target.clamp(MIN_STRIPES, MAX_STRIPES)
}

/// Which stripe a given `update()` call lands on. Correctness is identical
/// across variants; they only differ in how contention on the chooser
/// itself is distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chooser {
    /// A single shared atomic index, post-incremented mod `stripe_count`.
    /// Strictly balanced, but contends one cache line across all threads.
    RoundRobin,
    /// Each calling thread keeps a thread-local xorshift64 generator and
    /// picks a stripe from it. No shared chooser state.
    PerThread,
    /// Each calling thread is assigned a sticky index (first-touch, capped
    /// at `stripe_count`) meant to approximate per-CPU binding. Rust's
    /// standard library has no portable "current logical CPU" query, so
    /// this is a first-touch approximation rather than true affinity.
    PerCpu,
}

thread_local! {
    static XORSHIFT_STATE: Cell<u64> = Cell::new(0x9E3779B97F4A7C15);
    static STICKY_INDEX: Cell<Option<usize>> = Cell::new(None);
}

fn xorshift_next() -> u64 {
    XORSHIFT_STATE.with(|s| {
        let mut x = s.get();
        if x == 0 {
            x = 0x9E3779B97F4A7C15;
        }
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

struct StripeChooserState {
    round_robin: AtomicUsize,
    sticky_counter: AtomicUsize,
}

/// The striped representation of `A_net`, with an optional hierarchical
/// grouping of stripes for cheaper `sum()` on large stripe counts.
pub struct StripeSet {
    stripes: Box<[CacheAligned<AtomicI64>]>,
    committed_offset: CacheAligned<AtomicI64>,
    chooser: Chooser,
    chooser_state: StripeChooserState,
    /// `group_subtotals[g]` is eagerly kept equal to the sum of every
    /// stripe whose index maps to group `g` via `group_of`.
    group_subtotals: Option<Box<[CacheAligned<AtomicI64>]>>,
    group_of: Option<Box<[usize]>>,
}

impl StripeSet {
    /// Creates a stripe set with `stripe_count` stripes (rounded/clamped to
    /// a valid power of two) and, if `group_count` is `Some`, hierarchical
    /// group subtotals partitioning the stripes roughly evenly.
    pub fn new(stripe_count: usize, group_count: Option<usize>) -> Self {
        let stripe_count = stripe_count.next_power_of_two().clamp(MIN_STRIPES, MAX_STRIPES);
        let stripes = (0..stripe_count)
            .map(|_| CacheAligned::new(AtomicI64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let (group_subtotals, group_of) = match group_count {
            Some(g) if g > 0 && g < stripe_count => {
                let subtotals = (0..g)
                    .map(|_| CacheAligned::new(AtomicI64::new(0)))
                    .collect::<Vec<_>>()
                    .into_boxed_slice();
                let mapping = (0..stripe_count)
                    .map(|i| i * g / stripe_count)
                    .collect::<Vec<_>>()
                    .into_boxed_slice();
                (Some(subtotals), Some(mapping))
            }
            _ => (None, None),
        };

        Self {
            stripes,
            committed_offset: CacheAligned::new(AtomicI64::new(0)),
            chooser: Chooser::RoundRobin,
            chooser_state: StripeChooserState {
                round_robin: AtomicUsize::new(0),
                sticky_counter: AtomicUsize::new(0),
            },
            group_subtotals,
            group_of,
        }
    }

    pub fn with_chooser(mut self, chooser: Chooser) -> Self {
        self.chooser = chooser;
        self
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Picks the stripe index for the next `add()` call.
    fn choose_index(&self) -> usize {
        let n = self.stripes.len();
        match self.chooser {
            Chooser::RoundRobin => self.chooser_state.round_robin.fetch_add(1, Ordering::Relaxed) % n,
            Chooser::PerThread => (xorshift_next() as usize) % n,
            Chooser::PerCpu => STICKY_INDEX.with(|slot| {
                if let Some(idx) = slot.get() {
                    idx % n
                } else {
                    let idx = self.chooser_state.sticky_counter.fetch_add(1, Ordering::Relaxed);
                    slot.set(Some(idx));
                    idx % n
                }
            }),
        }
    }

    /// Adds `delta` to a chosen stripe (and its group subtotal, if any).
    /// Never blocks, never fails.
    pub fn add(&self, delta: i64) {
        let idx = self.choose_index();
        self.add_to_stripe(idx, delta);
    }

    /// Adds `delta` to a specific stripe. Used by the strict gate, which
    /// has already decided a stripe under its lock.
    pub fn add_to_stripe(&self, idx: usize, delta: i64) {
        self.stripes[idx].fetch_add(delta, Ordering::AcqRel);
        if let (Some(subtotals), Some(group_of)) = (&self.group_subtotals, &self.group_of) {
            subtotals[group_of[idx]].fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// A stripe index usable by the strict gate to land its reservation.
    /// Reuses the configured chooser.
    pub fn gate_stripe_index(&self) -> usize {
        self.choose_index()
    }

    /// Sum of all stripes (via group subtotals when present, which halves
    /// or better the number of cache lines touched for large stripe counts).
    pub fn stripe_sum(&self) -> i64 {
        if let Some(subtotals) = &self.group_subtotals {
            subtotals.iter().map(|g| g.load(Ordering::Acquire)).sum()
        } else {
            self.stripes.iter().map(|s| s.load(Ordering::Acquire)).sum()
        }
    }

    /// `A_net = sum(stripes) - committed_offset`.
    pub fn net(&self) -> i64 {
        self.stripe_sum() - self.committed_offset.load(Ordering::Acquire)
    }

    pub fn committed_offset(&self) -> i64 {
        self.committed_offset.load(Ordering::Acquire)
    }

    /// Moves `v` units from volatile to durable state: `committed_offset +=
    /// v`, which is algebraically equivalent to `A_net -= v` without
    /// touching any stripe.
    pub fn apply_commit(&self, v: i64) {
        self.committed_offset.fetch_add(v, Ordering::AcqRel);
    }
}
