use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RebacError;

/// A subject set: "every subject holding `relation` on `namespace:object`"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectSet {
    pub namespace: String,
    pub object: String,
    pub relation: String,
}

impl SubjectSet {
    pub fn new(namespace: &str, object: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
        }
    }
}

impl fmt::Display for SubjectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.namespace, self.object, self.relation)
    }
}

/// Represents a subject in the authorization system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Subject {
    /// A concrete subject such as `User:alice`
    Id { namespace: String, id: String },
    /// An indirect subject resolved through another relation
    Set(SubjectSet),
}

impl Subject {
    pub fn id(namespace: &str, id: &str) -> Self {
        Subject::Id {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::id("User", user_id)
    }

    pub fn set(namespace: &str, object: &str, relation: &str) -> Self {
        Subject::Set(SubjectSet::new(namespace, object, relation))
    }

    pub fn namespace(&self) -> &str {
        match self {
            Subject::Id { namespace, .. } => namespace,
            Subject::Set(set) => &set.namespace,
        }
    }

    pub fn as_set(&self) -> Option<&SubjectSet> {
        match self {
            Subject::Set(set) => Some(set),
            Subject::Id { .. } => None,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Subject::Id { .. })
    }

    /// Subject rendered for log fields, with the identifier redacted
    pub fn redacted(&self) -> String {
        logger_redacted::redact_identifier(&self.to_string())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Id { namespace, id } => write!(f, "{}:{}", namespace, id),
            Subject::Set(set) => write!(f, "{}", set),
        }
    }
}

impl From<SubjectSet> for Subject {
    fn from(set: SubjectSet) -> Self {
        Subject::Set(set)
    }
}

impl FromStr for Subject {
    type Err = RebacError;

    /// Parses `Namespace:id` or `Namespace:object#relation`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, rest) = s
            .split_once(':')
            .ok_or_else(|| RebacError::InvalidSubject(format!("missing ':' in '{}'", s)))?;

        let subject = match rest.split_once('#') {
            Some((object, relation)) => Subject::set(namespace, object, relation),
            None => Subject::id(namespace, rest),
        };

        let parts_empty = match &subject {
            Subject::Id { namespace, id } => namespace.is_empty() || id.is_empty(),
            Subject::Set(set) => {
                set.namespace.is_empty() || set.object.is_empty() || set.relation.is_empty()
            }
        };
        if parts_empty {
            return Err(RebacError::InvalidSubject(format!("empty component in '{}'", s)));
        }

        Ok(subject)
    }
}

/// Relation tuple: `namespace:object#relation@subject`
///
/// Tuples are immutable facts. A logical update is a delete followed by an
/// insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationTuple {
    pub namespace: String,
    pub object: String,
    pub relation: String,
    pub subject: Subject,
}

impl RelationTuple {
    pub fn new(namespace: &str, object: &str, relation: &str, subject: Subject) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
            subject,
        }
    }

    /// The (namespace, object, relation) triple this tuple is scanned under
    pub fn object_relation(&self) -> SubjectSet {
        SubjectSet::new(&self.namespace, &self.object, &self.relation)
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}",
            self.namespace, self.object, self.relation, self.subject
        )
    }
}

impl FromStr for RelationTuple {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RebacError::InvalidTuple(format!("{} in '{}'", reason, s));

        let (object_part, subject_part) = s.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
        let (namespace, rest) = object_part
            .split_once(':')
            .ok_or_else(|| invalid("missing ':'"))?;
        let (object, relation) = rest.split_once('#').ok_or_else(|| invalid("missing '#'"))?;

        if namespace.is_empty() || object.is_empty() || relation.is_empty() {
            return Err(invalid("empty component"));
        }

        let subject = subject_part
            .parse::<Subject>()
            .map_err(|e| invalid(&e.to_string()))?;

        Ok(RelationTuple::new(namespace, object, relation, subject))
    }
}

/// Monotonically increasing logical timestamp assigned at commit
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SnapshotToken(pub u64);

impl SnapshotToken {
    /// Snapshot of the empty store, before any commit
    pub const ZERO: SnapshotToken = SnapshotToken(0);

    pub fn version(self) -> u64 {
        self.0
    }

    pub fn next(self) -> SnapshotToken {
        SnapshotToken(self.0 + 1)
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotToken {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(SnapshotToken)
            .map_err(|_| RebacError::InvalidConsistencyToken(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TupleAction {
    Insert,
    Delete,
}

/// One mutation inside a write transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleOp {
    pub action: TupleAction,
    pub tuple: RelationTuple,
}

impl TupleOp {
    pub fn insert(tuple: RelationTuple) -> Self {
        Self {
            action: TupleAction::Insert,
            tuple,
        }
    }

    pub fn delete(tuple: RelationTuple) -> Self {
        Self {
            action: TupleAction::Delete,
            tuple,
        }
    }
}

/// Batch of tuple mutations committed atomically
///
/// `base` is the snapshot the writer observed. The commit is rejected with
/// a conflict when any touched tuple changed after `base`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTransaction {
    pub base: SnapshotToken,
    pub ops: Vec<TupleOp>,
}

impl WriteTransaction {
    pub fn new(base: SnapshotToken) -> Self {
        Self {
            base,
            ops: Vec::new(),
        }
    }

    pub fn insert(mut self, tuple: RelationTuple) -> Self {
        self.ops.push(TupleOp::insert(tuple));
        self
    }

    pub fn delete(mut self, tuple: RelationTuple) -> Self {
        self.ops.push(TupleOp::delete(tuple));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of a committed write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub snapshot: SnapshotToken,
    pub committed_at: DateTime<Utc>,
}

/// Partial filter over stored tuples; `None` fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleQuery {
    pub namespace: String,
    pub object: Option<String>,
    pub relation: Option<String>,
    pub subject: Option<Subject>,
}

impl TupleQuery {
    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn with_object(mut self, object: &str) -> Self {
        self.object = Some(object.to_string());
        self
    }

    pub fn with_relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        tuple.namespace == self.namespace
            && self.object.as_ref().map_or(true, |o| *o == tuple.object)
            && self.relation.as_ref().map_or(true, |r| *r == tuple.relation)
            && self.subject.as_ref().map_or(true, |s| *s == tuple.subject)
    }
}

/// Authorization check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub namespace: String,
    pub object: String,
    pub permission: String,
    pub subject: Subject,
    /// Evaluate at this snapshot; the latest one when absent
    pub snapshot: Option<SnapshotToken>,
    /// Overrides the engine's request timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl CheckRequest {
    pub fn new(namespace: &str, object: &str, permission: &str, subject: Subject) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            permission: permission.to_string(),
            subject,
            snapshot: None,
            timeout: None,
        }
    }

    pub fn at(mut self, snapshot: SnapshotToken) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Authorization check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub snapshot: SnapshotToken,
}

/// Expand request to resolve all subjects of a relation or permission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandRequest {
    pub namespace: String,
    pub object: String,
    pub relation: String,
    pub snapshot: Option<SnapshotToken>,
    /// Overrides the engine's depth budget
    pub max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ExpandRequest {
    pub fn new(namespace: &str, object: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
            snapshot: None,
            max_depth: None,
            timeout: None,
        }
    }

    pub fn at(mut self, snapshot: SnapshotToken) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn root(&self) -> SubjectSet {
        SubjectSet::new(&self.namespace, &self.object, &self.relation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNodeType {
    /// Subject set whose children are unioned
    Union,
    /// Concrete subject, or a subject set matched by equality only
    Leaf,
}

/// Subject tree node for expand responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectTree {
    pub node_type: TreeNodeType,
    pub subject: Subject,
    pub children: Vec<SubjectTree>,
}

impl SubjectTree {
    pub fn leaf(subject: Subject) -> Self {
        Self {
            node_type: TreeNodeType::Leaf,
            subject,
            children: Vec::new(),
        }
    }

    pub fn union(set: SubjectSet, children: Vec<SubjectTree>) -> Self {
        Self {
            node_type: TreeNodeType::Union,
            subject: Subject::Set(set),
            children,
        }
    }

    /// Concrete subjects reachable from this node, deduplicated
    pub fn leaves(&self) -> ahash::AHashSet<Subject> {
        let mut subjects = ahash::AHashSet::new();
        self.collect_leaves(&mut subjects);
        subjects
    }

    fn collect_leaves(&self, subjects: &mut ahash::AHashSet<Subject>) {
        if self.node_type == TreeNodeType::Leaf && self.subject.is_concrete() {
            subjects.insert(self.subject.clone());
        }
        for child in &self.children {
            child.collect_leaves(subjects);
        }
    }
}

/// Expand response: the resolution tree and the snapshot it was computed at
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandResponse {
    pub tree: SubjectTree,
    pub snapshot: SnapshotToken,
}

/// Flattened expand result: concrete subjects, sorted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectsResponse {
    pub subjects: Vec<Subject>,
    pub snapshot: SnapshotToken,
}

/// Readable snapshots of a store: every token in `watermark..=head`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotRange {
    /// Oldest snapshot whose tuple versions are still stored
    pub watermark: SnapshotToken,
    /// Token of the most recent commit
    pub head: SnapshotToken,
}

impl SnapshotRange {
    pub fn contains(&self, token: SnapshotToken) -> bool {
        self.watermark <= token && token <= self.head
    }
}

/// Outcome of a compaction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Oldest snapshot still readable
    pub watermark: SnapshotToken,
    /// Tuple versions physically removed
    pub removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_string_form() {
        let tuple: RelationTuple = "Permission:doc1#granted@Role:admin#member".parse().unwrap();
        assert_eq!(tuple.namespace, "Permission");
        assert_eq!(tuple.object, "doc1");
        assert_eq!(tuple.relation, "granted");
        assert_eq!(tuple.subject, Subject::set("Role", "admin", "member"));
        assert_eq!(tuple.to_string(), "Permission:doc1#granted@Role:admin#member");

        let direct: RelationTuple = "Role:admin#member@User:alice".parse().unwrap();
        assert_eq!(direct.subject, Subject::user("alice"));
    }

    #[test]
    fn test_invalid_tuple_strings() {
        assert!("Role:admin#member".parse::<RelationTuple>().is_err());
        assert!("Role:#member@User:alice".parse::<RelationTuple>().is_err());
        assert!("Role:admin#member@alice".parse::<RelationTuple>().is_err());
        assert!("Role:admin#member@User:".parse::<RelationTuple>().is_err());
    }

    #[test]
    fn test_query_matching() {
        let tuple = RelationTuple::new("Role", "admin", "member", Subject::user("alice"));
        assert!(TupleQuery::namespace("Role").matches(&tuple));
        assert!(TupleQuery::namespace("Role")
            .with_relation("member")
            .with_subject(Subject::user("alice"))
            .matches(&tuple));
        assert!(!TupleQuery::namespace("Role").with_object("auditor").matches(&tuple));
        assert!(!TupleQuery::namespace("Permission").matches(&tuple));
    }

    #[test]
    fn test_tree_leaves_deduplicate() {
        let tree = SubjectTree::union(
            SubjectSet::new("Permission", "doc1", "view"),
            vec![
                SubjectTree::leaf(Subject::user("alice")),
                SubjectTree::union(
                    SubjectSet::new("Role", "admin", "member"),
                    vec![SubjectTree::leaf(Subject::user("alice"))],
                ),
                SubjectTree::leaf(Subject::set("Role", "other", "member")),
            ],
        );
        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 1);
        assert!(leaves.contains(&Subject::user("alice")));
    }
}
