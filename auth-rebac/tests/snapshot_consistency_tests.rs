//! Snapshot consistency under compaction and concurrency
//!
//! Scenarios:
//! 1. A compaction by one engine expires old snapshots for every engine on the store
//! 2. A check without a snapshot survives a compaction that overtakes its head
//! 3. The same, when the compaction runs in another engine mid-request
//! 4. Readers see whole batches while writes and compactions run concurrently

use async_trait::async_trait;
use auth_rebac::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

fn member(role: &str, user: &str) -> RelationTuple {
    RelationTuple::new("Role", role, "member", Subject::user(user))
}

fn is_member(role: &str, user: &str) -> CheckRequest {
    CheckRequest::new("Role", role, "member", Subject::user(user))
}

/// Store that parks the first `snapshot_range` caller after arming, right
/// after it read the range
struct GatedStore {
    inner: Arc<InMemoryTupleStore>,
    armed: AtomicBool,
    parked: Notify,
    release: Notify,
}

impl GatedStore {
    fn new(inner: Arc<InMemoryTupleStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            parked: Notify::new(),
            release: Notify::new(),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TupleStore for GatedStore {
    async fn commit(&self, transaction: WriteTransaction) -> Result<SnapshotToken> {
        self.inner.commit(transaction).await
    }

    async fn scan(
        &self,
        namespace: &str,
        object: &str,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Subject>> {
        self.inner.scan(namespace, object, relation, snapshot).await
    }

    async fn exists(&self, tuple: &RelationTuple, snapshot: SnapshotToken) -> Result<bool> {
        self.inner.exists(tuple, snapshot).await
    }

    async fn read_tuples(
        &self,
        query: &TupleQuery,
        snapshot: SnapshotToken,
    ) -> Result<Vec<RelationTuple>> {
        self.inner.read_tuples(query, snapshot).await
    }

    async fn latest(&self) -> Result<SnapshotToken> {
        self.inner.latest().await
    }

    async fn snapshot_range(&self) -> Result<SnapshotRange> {
        let range = self.inner.snapshot_range().await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.release.notified().await;
        }
        Ok(range)
    }

    async fn compact(&self, watermark: SnapshotToken) -> Result<CompactionReport> {
        self.inner.compact(watermark).await
    }
}

#[tokio::test]
async fn test_scenario_1_compaction_expires_snapshots_for_every_engine() {
    let store = Arc::new(InMemoryTupleStore::new());
    let first = AuthorizationEngine::new(store.clone()).unwrap();
    let running = AuthorizationEngine::new(store.clone()).unwrap();

    let granted = first.write_tuple(member("admin", "alice")).await.unwrap().snapshot;
    first.delete_tuple(member("admin", "alice")).await.unwrap();
    assert!(running.check(is_member("admin", "alice").at(granted)).await.unwrap().allowed);

    let report = first.compact().await.unwrap();
    assert_eq!(report.removed, 1);

    // An engine started after the compaction, as a restarted process would be
    let restarted = AuthorizationEngine::new(store.clone()).unwrap();

    for engine in [&running, &restarted] {
        let err = engine
            .check(is_member("admin", "alice").at(granted))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RebacError::SnapshotExpired { requested, watermark }
                if requested == granted && watermark == report.watermark
        ));

        let err = engine
            .expand_subjects(ExpandRequest::new("Role", "admin", "member").at(granted))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::SnapshotExpired { .. }));

        let latest = engine.check(is_member("admin", "alice")).await.unwrap();
        assert!(!latest.allowed);
        assert_eq!(latest.snapshot, report.watermark);
    }

    println!("✅ Scenario 1 PASSED: the watermark is shared through the store");
}

#[tokio::test]
async fn test_scenario_2_unpinned_check_survives_local_compaction() {
    let memory = Arc::new(InMemoryTupleStore::new());
    let gated = Arc::new(GatedStore::new(memory.clone()));
    let engine = Arc::new(AuthorizationEngine::new(gated.clone()).unwrap());
    engine.write_tuple(member("admin", "alice")).await.unwrap();

    gated.arm();
    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.check(is_member("admin", "alice")).await })
    };
    // The check has read head 1 and waits before pinning it
    gated.parked.notified().await;

    engine.write_tuple(member("admin", "bob")).await.unwrap();
    let report = engine.compact().await.unwrap();
    assert_eq!(report.watermark, SnapshotToken(2));

    gated.release.notify_one();
    let response = pending.await.unwrap().unwrap();
    assert!(response.allowed);
    assert_eq!(response.snapshot, SnapshotToken(2));

    println!("✅ Scenario 2 PASSED: a request without a snapshot never expires");
}

#[tokio::test]
async fn test_scenario_3_unpinned_check_restarts_after_remote_compaction() {
    let memory = Arc::new(InMemoryTupleStore::new());
    let gated = Arc::new(GatedStore::new(memory.clone()));
    let reader = Arc::new(AuthorizationEngine::new(gated.clone()).unwrap());
    let maintainer = AuthorizationEngine::new(memory.clone()).unwrap();
    maintainer.write_tuple(member("admin", "alice")).await.unwrap();

    gated.arm();
    let pending = {
        let reader = reader.clone();
        tokio::spawn(async move { reader.check(is_member("admin", "alice")).await })
    };
    gated.parked.notified().await;

    // The reader's pin is invisible to the other engine
    maintainer.write_tuple(member("admin", "bob")).await.unwrap();
    let report = maintainer.compact().await.unwrap();
    assert_eq!(report.watermark, SnapshotToken(2));

    gated.release.notify_one();
    let response = pending.await.unwrap().unwrap();
    assert!(response.allowed);
    assert_eq!(response.snapshot, SnapshotToken(2));
    assert_eq!(reader.consistency().pinned_count(), 0);

    println!("✅ Scenario 3 PASSED: a compacted head is re-read instead of answered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_4_readers_see_whole_batches_during_writes_and_compaction() {
    const BATCHES: u64 = 60;
    const READS: usize = 80;

    let engine = Arc::new(AuthorizationEngine::in_memory().unwrap());
    let writing = Arc::new(AtomicBool::new(true));

    // Batch i makes a{i} and b{i} the only members of Role:team
    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 1..=BATCHES {
                let mut ops = vec![
                    TupleOp::insert(member("team", &format!("a{i}"))),
                    TupleOp::insert(member("team", &format!("b{i}"))),
                ];
                if i > 1 {
                    ops.push(TupleOp::delete(member("team", &format!("a{}", i - 1))));
                    ops.push(TupleOp::delete(member("team", &format!("b{}", i - 1))));
                }
                let response = engine.write_relation_tuples(ops).await.unwrap();
                assert_eq!(response.snapshot, SnapshotToken(i));
                tokio::task::yield_now().await;
            }
        })
    };

    let compactor = {
        let engine = engine.clone();
        let writing = writing.clone();
        tokio::spawn(async move {
            let mut passes = 0;
            while writing.load(Ordering::SeqCst) {
                engine.compact().await.unwrap();
                passes += 1;
                tokio::task::yield_now().await;
            }
            passes
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                for _ in 0..READS {
                    let expanded = engine
                        .expand_subjects(ExpandRequest::new("Role", "team", "member"))
                        .await
                        .unwrap();
                    let n = expanded.snapshot.version();
                    let expected = if n == 0 {
                        Vec::new()
                    } else {
                        vec![
                            Subject::user(&format!("a{n}")),
                            Subject::user(&format!("b{n}")),
                        ]
                    };
                    assert_eq!(expanded.subjects, expected, "partial batch at snapshot {n}");

                    let check = engine
                        .check(is_member("team", &format!("b{n}")))
                        .await
                        .unwrap();
                    assert!(check.snapshot >= expanded.snapshot);
                    assert_eq!(check.allowed, n > 0 && check.snapshot.version() == n);

                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    writing.store(false, Ordering::SeqCst);
    let passes = compactor.await.unwrap();
    assert!(passes > 0);

    // Everything but the last batch is gone
    let report = engine.compact().await.unwrap();
    assert_eq!(report.watermark, SnapshotToken(BATCHES));
    let tuples = engine
        .read_tuples(TupleQuery::namespace("Role"), None)
        .await
        .unwrap();
    assert_eq!(tuples.len(), 2);
    assert_eq!(engine.consistency().pinned_count(), 0);

    println!("✅ Scenario 4 PASSED: no reader observed a partial batch");
}
