use crate::{
    error::Result,
    expand::SubjectExpander,
    models::*,
    registry::Registry,
    repository::TupleStore,
};
use ahash::AHashSet;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::debug;

enum NodeOutcome {
    /// The subject holds the node's relation directly
    Found,
    /// No direct match; these subject sets remain to be searched
    Pending(Vec<SubjectSet>),
}

/// Permission checker answers "does subject S hold permission P on object O"
/// at a fixed snapshot.
///
/// Each node evaluates its rewrite rule: direct operands first, as point
/// lookups of the exact tuple, then subject-set operands, whose sets are
/// searched level by level. All nodes of a level run concurrently and the
/// first match ends the check; the remaining lookups are dropped.
pub struct PermissionChecker {
    expander: SubjectExpander,
}

impl PermissionChecker {
    pub fn new(store: Arc<dyn TupleStore>, registry: Arc<Registry>, max_depth: u32) -> Self {
        Self {
            expander: SubjectExpander::new(store, registry, max_depth),
        }
    }

    pub fn from_expander(expander: SubjectExpander) -> Self {
        Self { expander }
    }

    /// Check whether `subject` holds `permission` on `namespace:object`.
    ///
    /// `subject` may itself be a subject set; it then matches tuples storing
    /// exactly that set. Fails with `NotFound` when the namespace or
    /// permission is unknown and with `DepthExceeded` when no match was
    /// found within the depth budget but the search was not finished.
    pub async fn check(
        &self,
        namespace: &str,
        object: &str,
        permission: &str,
        subject: &Subject,
        snapshot: SnapshotToken,
    ) -> Result<bool> {
        self.expander.registry().resolve_rule(namespace, permission)?;

        let mut frontier = vec![SubjectSet::new(namespace, object, permission)];
        let mut level = 0u32;

        while !frontier.is_empty() {
            if level >= self.expander.max_depth() {
                debug!(level, "Check ran out of depth budget");
                return Err(self.expander.depth_exceeded());
            }

            let mut next = Vec::new();
            {
                let mut seen = AHashSet::new();
                let mut pending: FuturesUnordered<_> = frontier
                    .iter()
                    .map(|node| self.check_node(node, subject, snapshot))
                    .collect();

                while let Some(outcome) = pending.next().await {
                    match outcome? {
                        NodeOutcome::Found => {
                            debug!(level, "Check matched");
                            return Ok(true);
                        }
                        NodeOutcome::Pending(children) => {
                            for child in children {
                                if seen.insert(child.clone()) {
                                    next.push(child);
                                }
                            }
                        }
                    }
                }
            }

            frontier = next;
            level += 1;
        }

        Ok(false)
    }

    async fn check_node(
        &self,
        node: &SubjectSet,
        subject: &Subject,
        snapshot: SnapshotToken,
    ) -> Result<NodeOutcome> {
        let Some(rule) = self.expander.rule_for(node) else {
            return Ok(NodeOutcome::Pending(Vec::new()));
        };

        for relation in rule.direct_relations() {
            let tuple = RelationTuple::new(&node.namespace, &node.object, relation, subject.clone());
            if self.expander.store().exists(&tuple, snapshot).await? {
                debug!(node = %node, relation, "Direct tuple matched");
                return Ok(NodeOutcome::Found);
            }
        }

        let children = self
            .expander
            .follow_subject_sets(node, &rule, snapshot)
            .await?;

        // A searched set equal to the subject is a match by equality
        if let Some(set) = subject.as_set() {
            if children.iter().any(|child| child == set) {
                return Ok(NodeOutcome::Found);
            }
        }

        Ok(NodeOutcome::Pending(children))
    }
}
