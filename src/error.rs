//! Error types for the VSA core.

use thiserror::Error;

/// Error type for VSA cell, store, and worker operations.
///
/// Rejection is not an error: `try_consume`/`try_refund` returning `false`
/// is a normal outcome and never surfaces here. These variants cover
/// programmer misuse and the handful of fallible external collaborators
/// (seeding, persistence).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VsaError {
    /// A non-positive `n` was passed to `try_consume`/`try_refund`, or a
    /// `commit(v)` magnitude exceeded the current `|A_net|`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cell or store has been closed; the operation was rejected.
    #[error("operation attempted on a closed cell")]
    Closed,

    /// The configured `Seeder` failed to produce an initial scalar.
    #[error("seed failed for key {key:?}: {reason}")]
    SeedFailed { key: String, reason: String },

    /// The configured `Persister` failed to apply a batch.
    #[error("persister failed: {0}")]
    PersisterFailed(String),
}

/// Convenience alias for VSA core operations.
pub type VsaResult<T> = Result<T, VsaError>;

/// Error type returned by a [`crate::persister::Persister`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersisterError {
    /// The write failed but is safe to retry with the same batch.
    #[error("retryable persister error: {0}")]
    Retryable(String),

    /// The write failed in a way that retrying will not fix.
    #[error("fatal persister error: {0}")]
    Fatal(String),
}

impl PersisterError {
    /// Whether the commit worker should re-propose the same batch next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersisterError::Retryable(_))
    }
}

impl From<PersisterError> for VsaError {
    fn from(e: PersisterError) -> Self {
        VsaError::PersisterFailed(e.to_string())
    }
}
