//! Property tests: union monotonicity, snapshot stability and expand
//! idempotence over random role/permission data

use auth_rebac::*;
use proptest::prelude::*;

const USERS: [&str; 4] = ["alice", "bob", "carol", "dave"];
const ROLES: [&str; 3] = ["admin", "auditor", "editor"];
const DOCS: [&str; 2] = ["doc1", "doc2"];

#[derive(Debug, Clone)]
enum Fact {
    Member(usize, usize),
    Granted(usize, usize),
    Holder(usize, usize),
}

impl Fact {
    fn tuple(&self) -> RelationTuple {
        match *self {
            Fact::Member(role, user) => {
                RelationTuple::new("Role", ROLES[role], "member", Subject::user(USERS[user]))
            }
            Fact::Granted(doc, role) => RelationTuple::new(
                "Permission",
                DOCS[doc],
                "granted",
                Subject::set("Role", ROLES[role], "member"),
            ),
            Fact::Holder(doc, user) => {
                RelationTuple::new("Permission", DOCS[doc], "holder", Subject::user(USERS[user]))
            }
        }
    }
}

fn fact() -> impl Strategy<Value = Fact> {
    prop_oneof![
        (0..ROLES.len(), 0..USERS.len()).prop_map(|(r, u)| Fact::Member(r, u)),
        (0..DOCS.len(), 0..ROLES.len()).prop_map(|(d, r)| Fact::Granted(d, r)),
        (0..DOCS.len(), 0..USERS.len()).prop_map(|(d, u)| Fact::Holder(d, u)),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn grants(engine: &AuthorizationEngine, snapshot: SnapshotToken) -> Vec<bool> {
    let mut result = Vec::new();
    for doc in DOCS {
        for user in USERS {
            let request = CheckRequest::new("Permission", doc, "view", Subject::user(user)).at(snapshot);
            result.push(engine.check(request).await.unwrap().allowed);
        }
    }
    result
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn adding_tuples_never_revokes(facts in prop::collection::vec(fact(), 1..12)) {
        runtime().block_on(async {
            let engine = AuthorizationEngine::in_memory().unwrap();
            let mut history: Vec<(SnapshotToken, Vec<bool>)> = Vec::new();

            for fact in &facts {
                let write = engine.write_tuple(fact.tuple()).await.unwrap();
                let current = grants(&engine, write.snapshot).await;

                if let Some((_, previous)) = history.last() {
                    for (before, after) in previous.iter().zip(&current) {
                        assert!(!before || *after, "a grant was lost after inserting {:?}", fact);
                    }
                }
                history.push((write.snapshot, current));
            }

            // Earlier snapshots still answer as they did
            for (snapshot, expected) in &history {
                assert_eq!(&grants(&engine, *snapshot).await, expected);
            }
        });
    }

    #[test]
    fn expand_is_idempotent_and_agrees_with_check(facts in prop::collection::vec(fact(), 0..12)) {
        runtime().block_on(async {
            let engine = AuthorizationEngine::in_memory().unwrap();
            let mut transaction = engine.transaction().await.unwrap();
            for fact in &facts {
                transaction = transaction.insert(fact.tuple());
            }
            let snapshot = engine.commit(transaction).await.unwrap().snapshot;

            for doc in DOCS {
                let request = ExpandRequest::new("Permission", doc, "view").at(snapshot);
                let first = engine.expand_subjects(request.clone()).await.unwrap();
                let second = engine.expand_subjects(request.clone()).await.unwrap();
                assert_eq!(first, second);

                let tree = engine.expand(request).await.unwrap();
                let from_tree: Vec<Subject> = {
                    let mut leaves: Vec<Subject> = tree.tree.leaves().into_iter().collect();
                    leaves.sort();
                    leaves
                };
                assert_eq!(from_tree, first.subjects);

                for user in USERS {
                    let allowed = engine
                        .check(CheckRequest::new("Permission", doc, "view", Subject::user(user)).at(snapshot))
                        .await
                        .unwrap()
                        .allowed;
                    assert_eq!(allowed, first.subjects.contains(&Subject::user(user)));
                }
            }
        });
    }
}
