//! The persister capability consumed by the commit worker.
//!
//! The core never models partial success: a batch either lands entirely or
//! the worker leaves every cell's `A_net` untouched and re-proposes the
//! same rows next tick.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::PersisterError;

/// One durable delta: apply `delta` to the cumulative committed scalar for
/// `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRow {
    pub key: String,
    pub delta: i64,
}

/// The single external write surface the VSA core depends on.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Durably applies every row in `rows`. On `Ok`, every row's effect is
    /// observable exactly once after a restart. On `Err`, no row's effect
    /// may be observable (or the call is safe to retry verbatim).
    async fn commit_batch(&self, rows: &[CommitRow]) -> Result<(), PersisterError>;
}

/// A minimal reference persister holding cumulative committed scalars in
/// memory. Not durable — useful for tests and demos, not production use.
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    scalars: DashMap<String, i64>,
    batches_applied: AtomicUsize,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative committed scalar currently recorded for `key`.
    pub fn scalar(&self, key: &str) -> i64 {
        self.scalars.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn batches_applied(&self) -> usize {
        self.batches_applied.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Persister for InMemoryPersister {
    async fn commit_batch(&self, rows: &[CommitRow]) -> Result<(), PersisterError> {
        for row in rows {
            *self.scalars.entry(row.key.clone()).or_insert(0) -= row.delta;
        }
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A test double that fails the first `fail_count` calls (retryable, by
/// default) before delegating to an inner persister.
pub struct FailingPersister<P> {
    inner: P,
    remaining_failures: AtomicUsize,
    fatal: bool,
}

impl<P: Persister> FailingPersister<P> {
    pub fn new(inner: P, fail_count: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(fail_count),
            fatal: false,
        }
    }

    pub fn fatal(inner: P, fail_count: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(fail_count),
            fatal: true,
        }
    }
}

#[async_trait]
impl<P: Persister> Persister for FailingPersister<P> {
    async fn commit_batch(&self, rows: &[CommitRow]) -> Result<(), PersisterError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            let msg = format!("injected failure, {} rows dropped", rows.len());
            return Err(if self.fatal {
                PersisterError::Fatal(msg)
            } else {
                PersisterError::Retryable(msg)
            });
        }
        self.inner.commit_batch(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_persister_applies_rows_as_subtraction() {
        let persister = InMemoryPersister::new();
        persister
            .commit_batch(&[
                CommitRow { key: "a".into(), delta: 40 },
                CommitRow { key: "b".into(), delta: -5 },
            ])
            .await
            .unwrap();
        assert_eq!(persister.scalar("a"), -40);
        assert_eq!(persister.scalar("b"), 5);
        assert_eq!(persister.batches_applied(), 1);
    }

    #[tokio::test]
    async fn failing_persister_recovers_after_injected_failures() {
        let persister = FailingPersister::new(InMemoryPersister::new(), 2);
        let rows = [CommitRow { key: "a".into(), delta: 10 }];
        assert!(persister.commit_batch(&rows).await.is_err());
        assert!(persister.commit_batch(&rows).await.is_err());
        assert!(persister.commit_batch(&rows).await.is_ok());
    }
}
