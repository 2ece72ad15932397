use crate::{
    error::{RebacError, Result},
    models::*,
    registry::{Registry, RewriteRule},
    repository::TupleStore,
};
use ahash::AHashSet;
use futures::future::{try_join_all, BoxFuture};
use std::sync::Arc;
use tracing::debug;

/// Subjects found while evaluating one `namespace:object#relation` node
#[derive(Debug, Default)]
pub(crate) struct NodeExpansion {
    /// Subjects stored on direct operands, concrete or not
    pub subjects: Vec<Subject>,
    /// Subject sets reached through subject-set operands
    pub children: Vec<SubjectSet>,
}

/// Subject expander resolves a relation or permission into the subjects
/// holding it, following subject-set indirection.
///
/// Traversal is bounded by `max_depth`: the requested object is level 0 and
/// every followed subject set adds one level. A traversal that would need a
/// level beyond the budget fails with [`RebacError::DepthExceeded`]; it is
/// never truncated. Subject sets are deduplicated within a level only, so a
/// cycle in tuple data exhausts the budget instead of looping.
pub struct SubjectExpander {
    store: Arc<dyn TupleStore>,
    registry: Arc<Registry>,
    max_depth: u32,
}

impl SubjectExpander {
    pub fn new(store: Arc<dyn TupleStore>, registry: Arc<Registry>, max_depth: u32) -> Self {
        Self {
            store,
            registry,
            max_depth,
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub(crate) fn store(&self) -> &Arc<dyn TupleStore> {
        &self.store
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn depth_exceeded(&self) -> RebacError {
        RebacError::DepthExceeded {
            max_depth: self.max_depth,
        }
    }

    /// Rule of a node met during traversal. A subject set unknown to the
    /// active registry grants nothing.
    pub(crate) fn rule_for(&self, node: &SubjectSet) -> Option<Arc<RewriteRule>> {
        match self.registry.resolve_rule(&node.namespace, &node.relation) {
            Ok(rule) => Some(rule),
            Err(e) => {
                debug!(node = %node, error = %e, "Skipping subject set unknown to the registry");
                None
            }
        }
    }

    /// Expand the full subject tree of `root` at `snapshot`
    pub async fn expand(&self, root: SubjectSet, snapshot: SnapshotToken) -> Result<SubjectTree> {
        self.registry.resolve_rule(&root.namespace, &root.relation)?;
        self.expand_tree(root, snapshot, 0).await
    }

    fn expand_tree(
        &self,
        node: SubjectSet,
        snapshot: SnapshotToken,
        depth: u32,
    ) -> BoxFuture<'_, Result<SubjectTree>> {
        Box::pin(async move {
            if depth >= self.max_depth {
                return Err(self.depth_exceeded());
            }

            let Some(rule) = self.rule_for(&node) else {
                return Ok(SubjectTree::union(node, Vec::new()));
            };

            debug!(node = %node, depth, "Expanding subject set");
            let expansion = self.expand_node(&node, &rule, snapshot).await?;

            let mut children: Vec<SubjectTree> = expansion
                .subjects
                .into_iter()
                .map(SubjectTree::leaf)
                .collect();
            let nested = try_join_all(
                expansion
                    .children
                    .into_iter()
                    .map(|child| self.expand_tree(child, snapshot, depth + 1)),
            )
            .await?;
            children.extend(nested);

            Ok(SubjectTree::union(node, children))
        })
    }

    /// Concrete subjects holding `root` at `snapshot`, deduplicated.
    ///
    /// Breadth-first: every node of a level is expanded concurrently and the
    /// level completes before the next one starts.
    pub async fn expand_subjects(
        &self,
        root: SubjectSet,
        snapshot: SnapshotToken,
    ) -> Result<AHashSet<Subject>> {
        self.registry.resolve_rule(&root.namespace, &root.relation)?;

        let mut subjects = AHashSet::new();
        let mut frontier = vec![root];
        let mut level = 0u32;

        while !frontier.is_empty() {
            if level >= self.max_depth {
                return Err(self.depth_exceeded());
            }

            let expansions = try_join_all(frontier.iter().map(|node| async move {
                match self.rule_for(node) {
                    Some(rule) => self.expand_node(node, &rule, snapshot).await,
                    None => Ok(NodeExpansion::default()),
                }
            }))
            .await?;

            let mut seen = AHashSet::new();
            let mut next = Vec::new();
            for expansion in expansions {
                subjects.extend(expansion.subjects.into_iter().filter(Subject::is_concrete));
                for child in expansion.children {
                    if seen.insert(child.clone()) {
                        next.push(child);
                    }
                }
            }

            debug!(level, frontier = frontier.len(), next = next.len(), "Expanded level");
            frontier = next;
            level += 1;
        }

        Ok(subjects)
    }

    /// Scan every relation `rule` reads on `node` once, splitting the result
    /// into direct subjects and subject sets to follow
    pub(crate) async fn expand_node(
        &self,
        node: &SubjectSet,
        rule: &RewriteRule,
        snapshot: SnapshotToken,
    ) -> Result<NodeExpansion> {
        let relations = rule.scanned_relations();
        let scans = try_join_all(relations.iter().map(|relation| {
            self.store
                .scan(&node.namespace, &node.object, relation, snapshot)
        }))
        .await?;

        let mut expansion = NodeExpansion::default();
        for (relation, stored) in relations.iter().zip(scans) {
            let direct = rule.has_direct(relation);
            for subject in stored {
                match subject.as_set() {
                    Some(set) if rule.follows(relation, &set.namespace, &set.relation) => {
                        expansion.children.push(set.clone());
                    }
                    _ if direct => expansion.subjects.push(subject),
                    _ => {}
                }
            }
        }

        Ok(expansion)
    }

    /// Subject sets reached from `node` through subject-set operands only
    pub(crate) async fn follow_subject_sets(
        &self,
        node: &SubjectSet,
        rule: &RewriteRule,
        snapshot: SnapshotToken,
    ) -> Result<Vec<SubjectSet>> {
        let mut relations: Vec<&str> = Vec::new();
        for operand in rule.subject_set_operands() {
            if !relations.contains(&operand.relation()) {
                relations.push(operand.relation());
            }
        }

        let scans = try_join_all(relations.iter().map(|relation| {
            self.store
                .scan(&node.namespace, &node.object, relation, snapshot)
        }))
        .await?;

        Ok(relations
            .iter()
            .zip(scans)
            .flat_map(|(relation, stored)| {
                stored.into_iter().filter_map(move |subject| match subject {
                    Subject::Set(set) if rule.follows(relation, &set.namespace, &set.relation) => {
                        Some(set)
                    }
                    _ => None,
                })
            })
            .collect())
    }
}
