//! Tuple storage
//!
//! [`TupleStore`] is the only mutable shared resource of the engine. All
//! mutation goes through [`TupleStore::commit`], which applies a batch of
//! inserts and deletes atomically under one freshly minted snapshot token.
//! Reads are always pinned to a snapshot.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryTupleStore;
pub use postgres::PostgresTupleStore;

use crate::{
    error::{RebacError, Result},
    models::*,
};
use async_trait::async_trait;
use error_common::RetryPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Versioned relation-tuple storage with snapshot reads
///
/// The store owns the snapshot watermark: once a compaction raised it, every
/// engine sharing the store rejects older snapshots, including engines in
/// other processes and engines started afterwards.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Commit a batch atomically and return its snapshot token.
    ///
    /// Fails with [`RebacError::Conflict`] when a touched tuple was modified
    /// by a commit newer than `transaction.base`, and with
    /// [`RebacError::SnapshotExpired`] when `base` is below the watermark.
    /// Inserting a live tuple and deleting a missing one are no-ops, but the
    /// batch still commits.
    ///
    /// A commit whose acknowledgement is lost may have been applied. Sending
    /// it again then fails with `Conflict` against the first attempt's own
    /// version, so callers that see `Conflict` after a storage error should
    /// re-read before treating the write as rejected.
    async fn commit(&self, transaction: WriteTransaction) -> Result<SnapshotToken>;

    /// Insert one tuple in a transaction based on the current head
    async fn put(&self, tuple: RelationTuple) -> Result<SnapshotToken> {
        let base = self.latest().await?;
        self.commit(WriteTransaction::new(base).insert(tuple)).await
    }

    /// Delete one tuple in a transaction based on the current head
    async fn delete(&self, tuple: RelationTuple) -> Result<SnapshotToken> {
        let base = self.latest().await?;
        self.commit(WriteTransaction::new(base).delete(tuple)).await
    }

    /// Subjects stored on `namespace:object#relation` as of `snapshot`,
    /// in key order. Snapshots below the watermark fail with
    /// [`RebacError::SnapshotExpired`], as for every read.
    async fn scan(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Subject>>;

    /// Point lookup of one tuple as of `snapshot`
    async fn exists(&self, tuple: &RelationTuple, snapshot: SnapshotToken) -> Result<bool>;

    /// Tuples matching a partial filter as of `snapshot`
    async fn read_tuples(&self, query: &TupleQuery, snapshot: SnapshotToken)
        -> Result<Vec<RelationTuple>>;

    /// Token of the most recent commit
    async fn latest(&self) -> Result<SnapshotToken>;

    /// Watermark and head, read together
    async fn snapshot_range(&self) -> Result<SnapshotRange>;

    /// Raise the watermark to `watermark` (never past the head, never
    /// backwards) and drop every tuple version and conflict-tracking entry
    /// no snapshot at or above it needs.
    async fn compact(&self, watermark: SnapshotToken) -> Result<CompactionReport>;
}

// ============================================================================
// Retry decorator
// ============================================================================

/// Retries transient storage failures with exponential backoff.
///
/// Only [`RebacError::StorageError`] is retried; conflicts and validation
/// errors reach the caller on the first occurrence. Retrying a commit is
/// safe because tuple operations are idempotent; a commit that did land
/// before its connection failed surfaces as a conflict on retry, logged as
/// an unknown outcome.
pub struct RetryingStore {
    inner: Arc<dyn TupleStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn TupleStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl TupleStore for RetryingStore {
    async fn commit(&self, transaction: WriteTransaction) -> Result<SnapshotToken> {
        let interrupted = AtomicBool::new(false);
        let result = self
            .policy
            .retry(
                "tuple_store.commit",
                || self.inner.commit(transaction.clone()),
                |e: &RebacError| {
                    let retryable = e.is_retryable();
                    if retryable {
                        interrupted.store(true, Ordering::Relaxed);
                    }
                    retryable
                },
            )
            .await;

        if let Err(e @ RebacError::Conflict { .. }) = &result {
            if interrupted.load(Ordering::Relaxed) {
                warn!(
                    base = %transaction.base,
                    error = %e,
                    "Commit conflicted after a storage failure; an earlier attempt may have been applied"
                );
            }
        }
        result
    }

    async fn scan(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Subject>> {
        self.policy
            .retry(
                "tuple_store.scan",
                || self.inner.scan(namespace, object, relation, snapshot),
                RebacError::is_retryable,
            )
            .await
    }

    async fn exists(&self, tuple: &RelationTuple, snapshot: SnapshotToken) -> Result<bool> {
        self.policy
            .retry(
                "tuple_store.exists",
                || self.inner.exists(tuple, snapshot),
                RebacError::is_retryable,
            )
            .await
    }

    async fn read_tuples(
        &self,
        query: &TupleQuery,
        snapshot: SnapshotToken,
    ) -> Result<Vec<RelationTuple>> {
        self.policy
            .retry(
                "tuple_store.read_tuples",
                || self.inner.read_tuples(query, snapshot),
                RebacError::is_retryable,
            )
            .await
    }

    async fn latest(&self) -> Result<SnapshotToken> {
        self.policy
            .retry(
                "tuple_store.latest",
                || self.inner.latest(),
                RebacError::is_retryable,
            )
            .await
    }

    async fn snapshot_range(&self) -> Result<SnapshotRange> {
        self.policy
            .retry(
                "tuple_store.snapshot_range",
                || self.inner.snapshot_range(),
                RebacError::is_retryable,
            )
            .await
    }

    async fn compact(&self, watermark: SnapshotToken) -> Result<CompactionReport> {
        self.policy
            .retry(
                "tuple_store.compact",
                || self.inner.compact(watermark),
                RebacError::is_retryable,
            )
            .await
    }
}
