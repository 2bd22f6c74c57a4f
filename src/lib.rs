//! Vector-Scalar Accumulator (VSA): a concurrent, in-memory state object
//! that separates committed state (a durable scalar `S`) from uncommitted
//! state (a volatile vector `A_net`), so high-frequency in-memory updates
//! can be coalesced into a small number of durable writes.
//!
//! The three core pieces are [`cell::VsaCell`] (the accumulator itself),
//! [`store::VsaStore`] (key-indexed cell lifecycle), and
//! [`worker::CommitWorker`] (the background extract/commit/evict cycle).
//! Everything outside those — an HTTP surface, a Prometheus exporter,
//! storage adapters, a CLI — is a caller's concern, not this crate's.

pub mod cell;
pub mod clock;
pub mod error;
pub mod metrics;
pub mod persister;
pub mod store;
pub mod stripe;
pub mod worker;

pub use cell::{CellConfig, CellState, GateMode, VsaCell};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{PersisterError, VsaError, VsaResult};
pub use persister::{CommitRow, InMemoryPersister, Persister};
pub use store::{FixedSeed, Seeder, StoreConfig, VsaStore};
pub use stripe::Chooser;
pub use worker::{CommitWorker, WorkerConfig, WorkerStats, WorkerStatsSnapshot};
