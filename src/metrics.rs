//! Metric names and thin recording wrappers, called directly at commit
//! worker call sites (no exporter is wired up in the core; see §1 Non-goals
//! — the ambient metrics layer is carried regardless).

use metrics::{counter, gauge, histogram};

pub const ROWS_COMMITTED: &str = "vsa_rows_committed_total";
pub const ROWS_FAILED: &str = "vsa_rows_failed_total";
pub const BATCHES_SENT: &str = "vsa_batches_sent_total";
pub const BATCH_SIZE: &str = "vsa_batch_size";
pub const CELLS_EVICTED: &str = "vsa_cells_evicted_total";
pub const RESIDENT_CELLS: &str = "vsa_resident_cells";

pub fn record_rows_committed(n: u64) {
    counter!(ROWS_COMMITTED).increment(n);
}

pub fn record_rows_failed(n: u64) {
    counter!(ROWS_FAILED).increment(n);
}

pub fn record_batch_sent(size: usize) {
    counter!(BATCHES_SENT).increment(1);
    histogram!(BATCH_SIZE).record(size as f64);
}

pub fn record_cells_evicted(n: u64) {
    counter!(CELLS_EVICTED).increment(n);
}

pub fn record_resident_cells(n: usize) {
    gauge!(RESIDENT_CELLS).set(n as f64);
}
