//! In-memory MVCC tuple store
//!
//! Tuples live in an ordered index keyed by `(namespace, object, relation)`
//! and then by subject, so a scan is a single map lookup and a namespace
//! listing is a range walk. Each key keeps its version history; a version
//! is visible at snapshot `T` when `created <= T` and it was not deleted at
//! or before `T`.
//!
//! The watermark is only written under the index write lock and only read
//! under a lock on the index, so a read never sees a compacted index
//! without also seeing the watermark that made its snapshot invalid.

use crate::{
    error::{RebacError, Result},
    models::*,
    repository::TupleStore,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

type ObjectRelation = (String, String, String);

#[derive(Debug, Clone, Copy)]
struct TupleVersion {
    created: u64,
    deleted: Option<u64>,
}

impl TupleVersion {
    fn visible_at(&self, snapshot: u64) -> bool {
        self.created <= snapshot && self.deleted.map_or(true, |d| d > snapshot)
    }

    fn is_live(&self) -> bool {
        self.deleted.is_none()
    }
}

type VersionIndex = BTreeMap<ObjectRelation, BTreeMap<Subject, Vec<TupleVersion>>>;

/// In-memory tuple store for tests, development and the CLI
pub struct InMemoryTupleStore {
    index: RwLock<VersionIndex>,
    /// Last commit that changed each tuple, for optimistic concurrency
    last_modified: DashMap<RelationTuple, SnapshotToken>,
    head: AtomicU64,
    watermark: AtomicU64,
    commit_lock: Mutex<()>,
}

impl InMemoryTupleStore {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(BTreeMap::new()),
            last_modified: DashMap::new(),
            head: AtomicU64::new(0),
            watermark: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
        }
    }

    /// Number of stored versions, live or not
    pub fn version_count(&self) -> usize {
        self.index
            .read()
            .values()
            .flat_map(|subjects| subjects.values())
            .map(Vec::len)
            .sum()
    }

    /// Tuples with a tracked last modification
    pub fn tracked_modifications(&self) -> usize {
        self.last_modified.len()
    }

    fn ensure_readable(&self, snapshot: SnapshotToken) -> Result<()> {
        let watermark = SnapshotToken(self.watermark.load(Ordering::Acquire));
        if snapshot < watermark {
            return Err(RebacError::SnapshotExpired {
                requested: snapshot,
                watermark,
            });
        }
        Ok(())
    }

    fn key_of(tuple: &RelationTuple) -> ObjectRelation {
        (
            tuple.namespace.clone(),
            tuple.object.clone(),
            tuple.relation.clone(),
        )
    }

    fn check_conflicts(&self, transaction: &WriteTransaction) -> Result<()> {
        // Modifications at or below the watermark are no longer tracked
        self.ensure_readable(transaction.base)?;
        for op in &transaction.ops {
            if let Some(modified_at) = self.last_modified.get(&op.tuple) {
                if *modified_at > transaction.base {
                    return Err(RebacError::Conflict {
                        tuple: op.tuple.to_string(),
                        base: transaction.base,
                        modified_at: *modified_at,
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply one op at `version`; returns whether visible state changed
    fn apply(index: &mut VersionIndex, op: &TupleOp, version: u64) -> bool {
        match op.action {
            TupleAction::Insert => {
                let history = index
                    .entry(Self::key_of(&op.tuple))
                    .or_default()
                    .entry(op.tuple.subject.clone())
                    .or_default();
                if history.iter().any(TupleVersion::is_live) {
                    return false;
                }
                history.push(TupleVersion {
                    created: version,
                    deleted: None,
                });
                true
            }
            TupleAction::Delete => {
                let live = index
                    .get_mut(&Self::key_of(&op.tuple))
                    .and_then(|subjects| subjects.get_mut(&op.tuple.subject))
                    .and_then(|history| history.iter_mut().find(|v| v.is_live()));
                match live {
                    Some(current) => {
                        current.deleted = Some(version);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

impl Default for InMemoryTupleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TupleStore for InMemoryTupleStore {
    async fn commit(&self, transaction: WriteTransaction) -> Result<SnapshotToken> {
        let _guard = self.commit_lock.lock();
        self.check_conflicts(&transaction)?;

        let version = self.head.load(Ordering::Acquire) + 1;
        let token = SnapshotToken(version);
        let mut changed = 0;
        {
            let mut index = self.index.write();
            for op in &transaction.ops {
                if Self::apply(&mut index, op, version) {
                    self.last_modified.insert(op.tuple.clone(), token);
                    changed += 1;
                }
            }
        }
        // Publish only after the whole batch is in the index
        self.head.store(version, Ordering::Release);

        debug!(
            snapshot = version,
            ops = transaction.ops.len(),
            changed,
            "Committed tuple batch"
        );
        Ok(token)
    }

    async fn scan(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Subject>> {
        let key = (namespace.to_string(), object.to_string(), relation.to_string());
        let index = self.index.read();
        self.ensure_readable(snapshot)?;

        Ok(index
            .get(&key)
            .map(|subjects| {
                subjects
                    .iter()
                    .filter(|(_, history)| history.iter().any(|v| v.visible_at(snapshot.version())))
                    .map(|(subject, _)| subject.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn exists(&self, tuple: &RelationTuple, snapshot: SnapshotToken) -> Result<bool> {
        let index = self.index.read();
        self.ensure_readable(snapshot)?;
        Ok(index
            .get(&Self::key_of(tuple))
            .and_then(|subjects| subjects.get(&tuple.subject))
            .map_or(false, |history| {
                history.iter().any(|v| v.visible_at(snapshot.version()))
            }))
    }

    async fn read_tuples(
        &self,
        query: &TupleQuery,
        snapshot: SnapshotToken,
    ) -> Result<Vec<RelationTuple>> {
        let index = self.index.read();
        self.ensure_readable(snapshot)?;
        let start = (query.namespace.clone(), String::new(), String::new());

        let tuples = index
            .range(start..)
            .take_while(|((namespace, _, _), _)| *namespace == query.namespace)
            .flat_map(|((namespace, object, relation), subjects)| {
                subjects
                    .iter()
                    .filter(|(_, history)| history.iter().any(|v| v.visible_at(snapshot.version())))
                    .map(move |(subject, _)| {
                        RelationTuple::new(namespace, object, relation, subject.clone())
                    })
            })
            .filter(|tuple| query.matches(tuple))
            .collect();

        Ok(tuples)
    }

    async fn latest(&self) -> Result<SnapshotToken> {
        Ok(SnapshotToken(self.head.load(Ordering::Acquire)))
    }

    async fn snapshot_range(&self) -> Result<SnapshotRange> {
        let _index = self.index.read();
        Ok(SnapshotRange {
            watermark: SnapshotToken(self.watermark.load(Ordering::Acquire)),
            head: SnapshotToken(self.head.load(Ordering::Acquire)),
        })
    }

    async fn compact(&self, watermark: SnapshotToken) -> Result<CompactionReport> {
        let _guard = self.commit_lock.lock();
        let mut index = self.index.write();

        let head = self.head.load(Ordering::Acquire);
        let current = self.watermark.load(Ordering::Acquire);
        let target = watermark.version().min(head).max(current);
        self.watermark.store(target, Ordering::Release);

        let mut removed = 0;
        for subjects in index.values_mut() {
            for history in subjects.values_mut() {
                let before = history.len();
                history.retain(|v| v.deleted.map_or(true, |d| d > target));
                removed += before - history.len();
            }
            subjects.retain(|_, history| !history.is_empty());
        }
        index.retain(|_, subjects| !subjects.is_empty());

        let tracked = self.last_modified.len();
        self.last_modified
            .retain(|_, modified_at| modified_at.version() > target);
        let untracked = tracked - self.last_modified.len();

        info!(watermark = target, removed, untracked, "Compacted in-memory tuple store");
        Ok(CompactionReport {
            watermark: SnapshotToken(target),
            removed,
        })
    }
}
