//! Integration tests for the ReBAC engine
//!
//! Scenarios:
//! 1. Role inheritance grants view; a stranger is denied
//! 2. A direct holder is allowed alongside role members
//! 3. Removing a membership denies at later snapshots, not at earlier ones
//! 4. A membership cycle in tuple data fails with DepthExceeded
//! 5. A slow store makes the check time out instead of answering
//! 6. Concurrent writers on the same tuple conflict
//! 7. Schema loading rejects rewrite cycles and accepts the YAML model

use async_trait::async_trait;
use auth_rebac::*;
use std::sync::Arc;
use std::time::Duration;

const NESTED_ROLES_YAML: &str = r#"
namespaces:
  - name: User
  - name: Role
    relations:
      - name: member
        subject_types:
          - { namespace: User }
          - { namespace: Role, relation: member }
  - name: Permission
    relations:
      - name: holder
        subject_types: [{ namespace: User }]
      - name: granted
        subject_types: [{ namespace: Role, relation: member }]
    permissions:
      - name: view
        union:
          - { kind: direct, relation: holder }
          - { kind: subject_set, relation: granted, namespace: Role, target: member }
"#;

// Helper to create test engine
fn create_test_engine() -> Arc<AuthorizationEngine> {
    Arc::new(AuthorizationEngine::in_memory().unwrap())
}

fn granted(doc: &str, role: &str) -> RelationTuple {
    RelationTuple::new("Permission", doc, "granted", Subject::set("Role", role, "member"))
}

fn holder(doc: &str, user: &str) -> RelationTuple {
    RelationTuple::new("Permission", doc, "holder", Subject::user(user))
}

fn member(role: &str, user: &str) -> RelationTuple {
    RelationTuple::new("Role", role, "member", Subject::user(user))
}

fn view(doc: &str, user: &str) -> CheckRequest {
    CheckRequest::new("Permission", doc, "view", Subject::user(user))
}

#[tokio::test]
async fn test_scenario_1_role_inheritance() {
    let engine = create_test_engine();

    engine
        .write_relation_tuples(vec![
            TupleOp::insert(granted("doc1", "admin")),
            TupleOp::insert(member("admin", "alice")),
        ])
        .await
        .unwrap();

    assert!(
        engine.check(view("doc1", "alice")).await.unwrap().allowed,
        "Alice should view doc1 through the admin role"
    );
    assert!(
        !engine.check(view("doc1", "bob")).await.unwrap().allowed,
        "Bob holds nothing and should be denied"
    );

    println!("✅ Scenario 1 PASSED: role inheritance");
}

#[tokio::test]
async fn test_scenario_2_direct_holder() {
    let engine = create_test_engine();

    engine
        .write_relation_tuples(vec![
            TupleOp::insert(granted("doc1", "admin")),
            TupleOp::insert(member("admin", "alice")),
        ])
        .await
        .unwrap();
    let write = engine.write_tuple(holder("doc1", "bob")).await.unwrap();

    let response = engine.check(view("doc1", "bob").at(write.snapshot)).await.unwrap();
    assert!(response.allowed, "Bob should view doc1 as a direct holder");
    assert_eq!(response.snapshot, write.snapshot);

    let subjects = engine
        .expand_subjects(ExpandRequest::new("Permission", "doc1", "view"))
        .await
        .unwrap();
    assert_eq!(subjects.subjects, vec![Subject::user("alice"), Subject::user("bob")]);

    println!("✅ Scenario 2 PASSED: direct holder path");
}

#[tokio::test]
async fn test_scenario_3_snapshot_isolation_after_removal() {
    let engine = create_test_engine();

    let before = engine
        .write_relation_tuples(vec![
            TupleOp::insert(granted("doc1", "admin")),
            TupleOp::insert(member("admin", "alice")),
        ])
        .await
        .unwrap();
    let after = engine.delete_tuple(member("admin", "alice")).await.unwrap();
    assert!(after.snapshot > before.snapshot);

    assert!(
        !engine.check(view("doc1", "alice").at(after.snapshot)).await.unwrap().allowed,
        "Alice lost the role at the post-removal snapshot"
    );
    assert!(
        engine.check(view("doc1", "alice").at(before.snapshot)).await.unwrap().allowed,
        "The pre-removal snapshot still grants view"
    );

    // Latest snapshot matches the post-removal one
    let latest = engine.check(view("doc1", "alice")).await.unwrap();
    assert!(!latest.allowed);
    assert_eq!(latest.snapshot, after.snapshot);

    println!("✅ Scenario 3 PASSED: snapshot isolation");
}

#[tokio::test]
async fn test_scenario_4_data_cycle_exceeds_depth() {
    let engine = create_test_engine();
    engine
        .load_schema(SchemaDefinition::from_yaml(NESTED_ROLES_YAML).unwrap())
        .unwrap();

    // Role A contains Role B's members and vice versa
    engine
        .write_relation_tuples(vec![
            TupleOp::insert(RelationTuple::new(
                "Role",
                "a",
                "member",
                Subject::set("Role", "b", "member"),
            )),
            TupleOp::insert(RelationTuple::new(
                "Role",
                "b",
                "member",
                Subject::set("Role", "a", "member"),
            )),
            TupleOp::insert(granted("doc1", "a")),
        ])
        .await
        .unwrap();

    let err = engine.check(view("doc1", "mallory")).await.unwrap_err();
    assert!(matches!(err, RebacError::DepthExceeded { max_depth: 25 }));

    let err = engine
        .expand(ExpandRequest::new("Role", "a", "member").with_max_depth(4))
        .await
        .unwrap_err();
    assert!(matches!(err, RebacError::DepthExceeded { max_depth: 4 }));

    // A member reachable inside the cycle is still found
    engine.write_tuple(member("b", "alice")).await.unwrap();
    assert!(engine.check(view("doc1", "alice")).await.unwrap().allowed);

    println!("✅ Scenario 4 PASSED: data cycles are bounded");
}

/// Store whose reads stall, for deadline tests
struct SlowStore {
    inner: InMemoryTupleStore,
    delay: Duration,
}

#[async_trait]
impl TupleStore for SlowStore {
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
        tokio::time::sleep(self.delay).await;
        self.inner.scan(namespace, object, relation, snapshot).await
    }

    async fn exists(&self, tuple: &RelationTuple, snapshot: SnapshotToken) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
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
        self.inner.snapshot_range().await
    }

    async fn compact(&self, watermark: SnapshotToken) -> Result<CompactionReport> {
        self.inner.compact(watermark).await
    }
}

#[tokio::test]
async fn test_scenario_5_timeout_is_an_error() {
    let store = Arc::new(SlowStore {
        inner: InMemoryTupleStore::new(),
        delay: Duration::from_millis(200),
    });
    let config = EngineConfig {
        storage_retry: RetryPolicy::no_retry(),
        ..Default::default()
    };
    let engine =
        AuthorizationEngine::with_config(store, Registry::builtin().unwrap(), config).unwrap();
    engine.write_tuple(member("admin", "alice")).await.unwrap();

    let err = engine
        .check(view("doc1", "alice").with_timeout(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, RebacError::Timeout { timeout_ms: 20 }));

    // With enough time the same check answers
    let response = engine
        .check(
            CheckRequest::new("Role", "admin", "member", Subject::user("alice"))
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(response.allowed);

    // Timed-out requests released their snapshot pins
    assert_eq!(engine.consistency().pinned_count(), 0);

    println!("✅ Scenario 5 PASSED: deadlines surface as errors");
}

#[tokio::test]
async fn test_scenario_6_concurrent_writers_conflict() {
    let engine = create_test_engine();
    engine.write_tuple(member("admin", "alice")).await.unwrap();

    let first = engine.transaction().await.unwrap().delete(member("admin", "alice"));
    let second = engine
        .transaction()
        .await
        .unwrap()
        .delete(member("admin", "alice"))
        .insert(member("admin", "bob"));

    engine.commit(first).await.unwrap();
    let err = engine.commit(second).await.unwrap_err();
    assert!(matches!(err, RebacError::Conflict { .. }));
    assert_eq!(err.code(), "WRITE_2001");

    // The rejected batch left nothing behind
    let members = engine
        .expand_subjects(ExpandRequest::new("Role", "admin", "member"))
        .await
        .unwrap();
    assert!(members.subjects.is_empty());

    println!("✅ Scenario 6 PASSED: optimistic concurrency");
}

#[tokio::test]
async fn test_scenario_7_schema_loading() {
    let engine = create_test_engine();

    let registry = engine
        .load_schema(SchemaDefinition::from_yaml(NESTED_ROLES_YAML).unwrap())
        .unwrap();
    assert_eq!(
        registry.kind_of("Permission", "view"),
        Some(RelationKind::Permission)
    );

    let cyclic = NESTED_ROLES_YAML.replace(
        "- { namespace: Role, relation: member }\n  - name: Permission",
        "- { namespace: Permission, relation: view }\n  - name: Permission",
    );
    let cyclic = SchemaDefinition::from_yaml(&cyclic).unwrap();
    let previous = engine.registry();
    assert!(matches!(
        engine.load_schema(cyclic),
        Err(RebacError::InvalidSchema(_))
    ));
    assert!(Arc::ptr_eq(&previous, &engine.registry()), "Failed loads keep the active registry");

    println!("✅ Scenario 7 PASSED: schema validation");
}

#[tokio::test]
async fn test_batch_check_and_tree() {
    let engine = create_test_engine();
    engine
        .write_relation_tuples(vec![
            TupleOp::insert(granted("doc1", "admin")),
            TupleOp::insert(member("admin", "alice")),
            TupleOp::insert(holder("doc1", "carol")),
        ])
        .await
        .unwrap();

    let responses = engine
        .batch_check(vec![
            view("doc1", "alice"),
            view("doc1", "bob"),
            view("doc1", "carol"),
        ])
        .await
        .unwrap();
    let allowed: Vec<bool> = responses.iter().map(|r| r.allowed).collect();
    assert_eq!(allowed, vec![true, false, true]);

    let expanded = engine
        .expand(ExpandRequest::new("Permission", "doc1", "view"))
        .await
        .unwrap();
    let leaves = expanded.tree.leaves();
    assert_eq!(leaves.len(), 2);
    assert!(leaves.contains(&Subject::user("alice")));
    assert!(leaves.contains(&Subject::user("carol")));
}
