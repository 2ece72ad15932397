//! Namespace registry: the compiled, immutable form of a schema definition
//!
//! Loading validates names and references, rejects rewrite cycles, and
//! compiles every relation and permission into a [`RewriteRule`]. A loaded
//! registry is never mutated; a schema change builds a new one.

use crate::{
    error::{RebacError, Result},
    models::{RelationTuple, Subject},
    schema::{OperandDefinition, SchemaDefinition},
};
use petgraph::{algo::toposort, graph::DiGraph};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use tracing::info;

/// One operand of a union rewrite rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleOperand {
    /// Subject appears in a tuple stored on `relation` of the same object
    Direct { relation: String },
    /// Subject is a member of a `namespace#target` subject set stored on
    /// `relation` of the same object
    SubjectSet {
        relation: String,
        namespace: String,
        target: String,
    },
}

impl RuleOperand {
    /// Relation on the evaluated object that this operand scans
    pub fn relation(&self) -> &str {
        match self {
            RuleOperand::Direct { relation } | RuleOperand::SubjectSet { relation, .. } => {
                relation
            }
        }
    }
}

/// Union of operands; direct operands are ordered before subject-set ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub operands: Vec<RuleOperand>,
}

impl RewriteRule {
    fn new(mut operands: Vec<RuleOperand>) -> Self {
        // Stable sort keeps declaration order within each class.
        operands.sort_by_key(|op| matches!(op, RuleOperand::SubjectSet { .. }));
        Self { operands }
    }

    pub fn direct_relations(&self) -> impl Iterator<Item = &str> {
        self.operands.iter().filter_map(|op| match op {
            RuleOperand::Direct { relation } => Some(relation.as_str()),
            RuleOperand::SubjectSet { .. } => None,
        })
    }

    pub fn subject_set_operands(&self) -> impl Iterator<Item = &RuleOperand> {
        self.operands
            .iter()
            .filter(|op| matches!(op, RuleOperand::SubjectSet { .. }))
    }

    /// Distinct relations any operand scans, in operand order
    pub fn scanned_relations(&self) -> Vec<&str> {
        let mut seen = AHashSet::new();
        self.operands
            .iter()
            .map(RuleOperand::relation)
            .filter(|relation| seen.insert(*relation))
            .collect()
    }

    /// Whether a subject set found on `relation` is followed by this rule
    pub fn follows(&self, relation: &str, namespace: &str, target: &str) -> bool {
        self.operands.iter().any(|op| match op {
            RuleOperand::SubjectSet {
                relation: r,
                namespace: ns,
                target: t,
            } => r == relation && ns == namespace && t == target,
            RuleOperand::Direct { .. } => false,
        })
    }

    pub fn has_direct(&self, relation: &str) -> bool {
        self.direct_relations().any(|r| r == relation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Stored relation; tuples may be written to it
    Relation,
    /// Computed permission; evaluated only
    Permission,
}

/// Subject type accepted by a stored relation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectType {
    Namespace(String),
    SubjectSet { namespace: String, relation: String },
}

#[derive(Debug)]
struct CompiledRelation {
    kind: RelationKind,
    subject_types: Vec<SubjectType>,
    rule: Arc<RewriteRule>,
}

/// Compiled namespace registry
#[derive(Debug)]
pub struct Registry {
    namespaces: AHashMap<String, AHashMap<String, CompiledRelation>>,
    definition: SchemaDefinition,
}

impl Registry {
    /// Validate and compile a schema definition
    pub fn load(definition: SchemaDefinition) -> Result<Self> {
        let names = collect_names(&definition)?;
        let mut namespaces = AHashMap::new();

        for ns in &definition.namespaces {
            let mut compiled = AHashMap::new();

            for relation in &ns.relations {
                if relation.subject_types.is_empty() {
                    return Err(RebacError::InvalidSchema(format!(
                        "Relation '{}#{}' declares no subject types",
                        ns.name, relation.name
                    )));
                }

                let mut subject_types = Vec::with_capacity(relation.subject_types.len());
                let mut operands = vec![RuleOperand::Direct {
                    relation: relation.name.clone(),
                }];

                for subject_type in &relation.subject_types {
                    if !names.contains_key(&subject_type.namespace) {
                        return Err(RebacError::InvalidSchema(format!(
                            "Relation '{}#{}' references unknown namespace '{}'",
                            ns.name, relation.name, subject_type.namespace
                        )));
                    }
                    match &subject_type.relation {
                        None => subject_types.push(SubjectType::Namespace(
                            subject_type.namespace.clone(),
                        )),
                        Some(target) => {
                            require_entry(&names, &subject_type.namespace, target, || {
                                format!("subject type of '{}#{}'", ns.name, relation.name)
                            })?;
                            subject_types.push(SubjectType::SubjectSet {
                                namespace: subject_type.namespace.clone(),
                                relation: target.clone(),
                            });
                            operands.push(RuleOperand::SubjectSet {
                                relation: relation.name.clone(),
                                namespace: subject_type.namespace.clone(),
                                target: target.clone(),
                            });
                        }
                    }
                }

                compiled.insert(
                    relation.name.clone(),
                    CompiledRelation {
                        kind: RelationKind::Relation,
                        subject_types,
                        rule: Arc::new(RewriteRule::new(operands)),
                    },
                );
            }

            for permission in &ns.permissions {
                if permission.union.is_empty() {
                    return Err(RebacError::InvalidSchema(format!(
                        "Permission '{}#{}' has an empty union",
                        ns.name, permission.name
                    )));
                }

                let mut operands = Vec::with_capacity(permission.union.len());
                for operand in &permission.union {
                    operands.push(compile_operand(&definition, &names, &ns.name, operand).map_err(
                        |e| match e {
                            RebacError::InvalidSchema(msg) => RebacError::InvalidSchema(format!(
                                "Permission '{}#{}': {}",
                                ns.name, permission.name, msg
                            )),
                            other => other,
                        },
                    )?);
                }

                compiled.insert(
                    permission.name.clone(),
                    CompiledRelation {
                        kind: RelationKind::Permission,
                        subject_types: Vec::new(),
                        rule: Arc::new(RewriteRule::new(operands)),
                    },
                );
            }

            namespaces.insert(ns.name.clone(), compiled);
        }

        let registry = Self {
            namespaces,
            definition,
        };
        registry.detect_cycles()?;

        info!(
            namespaces = registry.namespaces.len(),
            "Namespace registry loaded"
        );
        Ok(registry)
    }

    /// Registry for the built-in User/Role/Permission model
    pub fn builtin() -> Result<Self> {
        Self::load(SchemaDefinition::role_permission_model())
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn kind_of(&self, namespace: &str, relation: &str) -> Option<RelationKind> {
        self.entry(namespace, relation).map(|r| r.kind)
    }

    /// Rewrite rule of a relation or permission
    pub fn resolve_rule(&self, namespace: &str, relation: &str) -> Result<Arc<RewriteRule>> {
        self.entry(namespace, relation)
            .map(|r| r.rule.clone())
            .ok_or_else(|| not_found(self, namespace, relation))
    }

    /// Validate that a tuple conforms to the schema before it is written
    pub fn validate_tuple(&self, tuple: &RelationTuple) -> Result<()> {
        if tuple.object.is_empty() {
            return Err(RebacError::InvalidTuple(format!("Empty object id in {}", tuple)));
        }

        let entry = self.entry(&tuple.namespace, &tuple.relation).ok_or_else(|| {
            RebacError::InvalidTuple(format!(
                "Unknown relation '{}' for namespace '{}'",
                tuple.relation, tuple.namespace
            ))
        })?;

        if entry.kind == RelationKind::Permission {
            return Err(RebacError::InvalidTuple(format!(
                "'{}#{}' is a permission and cannot be written",
                tuple.namespace, tuple.relation
            )));
        }

        let accepted = entry.subject_types.iter().any(|st| match (st, &tuple.subject) {
            (SubjectType::Namespace(ns), Subject::Id { namespace, id }) => {
                ns == namespace && !id.is_empty()
            }
            (SubjectType::SubjectSet { namespace, relation }, Subject::Set(set)) => {
                *namespace == set.namespace && *relation == set.relation && !set.object.is_empty()
            }
            _ => false,
        });

        if !accepted {
            return Err(RebacError::InvalidTuple(format!(
                "Subject '{}' is not an accepted subject type of '{}#{}'",
                tuple.subject, tuple.namespace, tuple.relation
            )));
        }

        Ok(())
    }

    fn entry(&self, namespace: &str, relation: &str) -> Option<&CompiledRelation> {
        self.namespaces.get(namespace)?.get(relation)
    }

    /// Reject rewrite graphs with cycles through permissions.
    ///
    /// Nodes are `(namespace, relation)`. Permissions point at the relations
    /// their operands scan and at subject-set targets; relations point at
    /// declared subject-set targets only when the target is a permission.
    /// Relation-to-relation nesting is data recursion, bounded at query time.
    fn detect_cycles(&self) -> Result<()> {
        let mut graph = DiGraph::<(String, String), ()>::new();
        let mut nodes = AHashMap::new();

        for (ns, relations) in &self.namespaces {
            for name in relations.keys() {
                let key = (ns.clone(), name.clone());
                let idx = graph.add_node(key.clone());
                nodes.insert(key, idx);
            }
        }

        let node = |ns: &str, rel: &str| nodes.get(&(ns.to_string(), rel.to_string())).copied();

        for (ns, relations) in &self.namespaces {
            for (name, compiled) in relations {
                let Some(from) = node(ns, name) else { continue };
                match compiled.kind {
                    RelationKind::Permission => {
                        for operand in &compiled.rule.operands {
                            if let Some(to) = node(ns, operand.relation()) {
                                graph.add_edge(from, to, ());
                            }
                            if let RuleOperand::SubjectSet {
                                namespace, target, ..
                            } = operand
                            {
                                if let Some(to) = node(namespace, target) {
                                    graph.add_edge(from, to, ());
                                }
                            }
                        }
                    }
                    RelationKind::Relation => {
                        for subject_type in &compiled.subject_types {
                            if let SubjectType::SubjectSet { namespace, relation } = subject_type {
                                if self.kind_of(namespace, relation) == Some(RelationKind::Permission) {
                                    if let Some(to) = node(namespace, relation) {
                                        graph.add_edge(from, to, ());
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            let (ns, rel) = &graph[cycle.node_id()];
            RebacError::InvalidSchema(format!("Rewrite cycle detected through '{}#{}'", ns, rel))
        })
    }
}

/// Kind of every declared name, keyed by namespace
type NameIndex = AHashMap<String, AHashMap<String, RelationKind>>;

fn collect_names(definition: &SchemaDefinition) -> Result<NameIndex> {
    let mut names: NameIndex = AHashMap::new();

    for ns in &definition.namespaces {
        if ns.name.is_empty() {
            return Err(RebacError::InvalidSchema("Namespace with empty name".to_string()));
        }
        if names.contains_key(&ns.name) {
            return Err(RebacError::InvalidSchema(format!(
                "Duplicate namespace '{}'",
                ns.name
            )));
        }

        let mut entries = AHashMap::new();
        let declared = ns
            .relations
            .iter()
            .map(|r| (&r.name, RelationKind::Relation))
            .chain(ns.permissions.iter().map(|p| (&p.name, RelationKind::Permission)));

        for (name, kind) in declared {
            if name.is_empty() {
                return Err(RebacError::InvalidSchema(format!(
                    "Empty relation name in namespace '{}'",
                    ns.name
                )));
            }
            if entries.insert(name.clone(), kind).is_some() {
                return Err(RebacError::InvalidSchema(format!(
                    "Duplicate relation '{}' in namespace '{}'",
                    name, ns.name
                )));
            }
        }

        names.insert(ns.name.clone(), entries);
    }

    Ok(names)
}

fn require_entry(
    names: &NameIndex,
    namespace: &str,
    relation: &str,
    context: impl Fn() -> String,
) -> Result<RelationKind> {
    let entries = names.get(namespace).ok_or_else(|| {
        RebacError::InvalidSchema(format!("{} references unknown namespace '{}'", context(), namespace))
    })?;
    entries.get(relation).copied().ok_or_else(|| {
        RebacError::InvalidSchema(format!(
            "{} references unknown relation '{}#{}'",
            context(),
            namespace,
            relation
        ))
    })
}

fn compile_operand(
    definition: &SchemaDefinition,
    names: &NameIndex,
    namespace: &str,
    operand: &OperandDefinition,
) -> Result<RuleOperand> {
    let context = || "operand".to_string();

    match operand {
        OperandDefinition::Direct { relation } => {
            if require_entry(names, namespace, relation, context)? != RelationKind::Relation {
                return Err(RebacError::InvalidSchema(format!(
                    "direct operand '{}' must name a stored relation",
                    relation
                )));
            }
            Ok(RuleOperand::Direct {
                relation: relation.clone(),
            })
        }
        OperandDefinition::SubjectSet {
            relation,
            namespace: target_ns,
            target,
        } => {
            if require_entry(names, namespace, relation, context)? != RelationKind::Relation {
                return Err(RebacError::InvalidSchema(format!(
                    "subject-set operand '{}' must name a stored relation",
                    relation
                )));
            }
            require_entry(names, target_ns, target, context)?;

            let declared = definition
                .namespaces
                .iter()
                .find(|ns| ns.name == namespace)
                .and_then(|ns| ns.relations.iter().find(|r| r.name == *relation))
                .map_or(false, |r| {
                    r.subject_types.iter().any(|st| {
                        st.namespace == *target_ns && st.relation.as_deref() == Some(target.as_str())
                    })
                });
            if !declared {
                return Err(RebacError::InvalidSchema(format!(
                    "relation '{}' does not accept subject set '{}#{}'",
                    relation, target_ns, target
                )));
            }

            Ok(RuleOperand::SubjectSet {
                relation: relation.clone(),
                namespace: target_ns.clone(),
                target: target.clone(),
            })
        }
    }
}

fn not_found(registry: &Registry, namespace: &str, relation: &str) -> RebacError {
    if registry.has_namespace(namespace) {
        RebacError::NotFound(format!("relation '{}#{}'", namespace, relation))
    } else {
        RebacError::NotFound(format!("namespace '{}'", namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        NamespaceDefinition, PermissionDefinition, RelationDefinition, SubjectTypeDefinition,
    };

    fn user_ns() -> NamespaceDefinition {
        NamespaceDefinition::new("User")
    }

    #[test]
    fn test_builtin_rules() {
        let registry = Registry::builtin().unwrap();

        let view = registry.resolve_rule("Permission", "view").unwrap();
        assert_eq!(
            view.operands,
            vec![
                RuleOperand::Direct {
                    relation: "holder".to_string()
                },
                RuleOperand::SubjectSet {
                    relation: "granted".to_string(),
                    namespace: "Role".to_string(),
                    target: "member".to_string(),
                },
            ]
        );

        let granted = registry.resolve_rule("Permission", "granted").unwrap();
        assert!(granted.has_direct("granted"));
        assert!(granted.follows("granted", "Role", "member"));

        assert_eq!(
            registry.kind_of("Permission", "view"),
            Some(RelationKind::Permission)
        );
        assert_eq!(registry.kind_of("Role", "member"), Some(RelationKind::Relation));
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let registry = Registry::builtin().unwrap();
        assert!(matches!(
            registry.resolve_rule("Document", "view"),
            Err(RebacError::NotFound(_))
        ));
        assert!(matches!(
            registry.resolve_rule("Permission", "edit"),
            Err(RebacError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_relation_rejected() {
        let schema = SchemaDefinition {
            namespaces: vec![
                user_ns(),
                NamespaceDefinition::new("Role")
                    .with_relation(RelationDefinition::new(
                        "member",
                        vec![SubjectTypeDefinition::namespace("User")],
                        "",
                    ))
                    .with_permission(PermissionDefinition {
                        name: "member".to_string(),
                        union: vec![OperandDefinition::Direct {
                            relation: "member".to_string(),
                        }],
                        description: String::new(),
                    }),
            ],
        };
        let err = Registry::load(schema).unwrap_err();
        assert!(err.to_string().contains("Duplicate relation 'member'"));
    }

    #[test]
    fn test_duplicate_namespace_rejected() {
        let schema = SchemaDefinition {
            namespaces: vec![user_ns(), user_ns()],
        };
        assert!(matches!(
            Registry::load(schema),
            Err(RebacError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_unknown_namespace_reference_rejected() {
        let schema = SchemaDefinition {
            namespaces: vec![NamespaceDefinition::new("Role").with_relation(
                RelationDefinition::new("member", vec![SubjectTypeDefinition::namespace("User")], ""),
            )],
        };
        let err = Registry::load(schema).unwrap_err();
        assert!(err.to_string().contains("unknown namespace 'User'"));
    }

    #[test]
    fn test_undeclared_subject_set_operand_rejected() {
        let mut schema = SchemaDefinition::role_permission_model();
        let permission = schema
            .namespaces
            .iter_mut()
            .find(|ns| ns.name == "Permission")
            .unwrap();
        permission.permissions[0].union.push(OperandDefinition::SubjectSet {
            relation: "holder".to_string(),
            namespace: "Role".to_string(),
            target: "member".to_string(),
        });
        assert!(matches!(
            Registry::load(schema),
            Err(RebacError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_cycle_through_permission_rejected() {
        // Role#member accepts Permission#view sets, and Permission#view
        // follows Role#member: Role -> Permission -> Role.
        let schema = SchemaDefinition {
            namespaces: vec![
                user_ns(),
                NamespaceDefinition::new("Role").with_relation(RelationDefinition::new(
                    "member",
                    vec![
                        SubjectTypeDefinition::namespace("User"),
                        SubjectTypeDefinition::subject_set("Permission", "view"),
                    ],
                    "",
                )),
                NamespaceDefinition::new("Permission")
                    .with_relation(RelationDefinition::new(
                        "granted",
                        vec![SubjectTypeDefinition::subject_set("Role", "member")],
                        "",
                    ))
                    .with_permission(PermissionDefinition {
                        name: "view".to_string(),
                        union: vec![OperandDefinition::SubjectSet {
                            relation: "granted".to_string(),
                            namespace: "Role".to_string(),
                            target: "member".to_string(),
                        }],
                        description: String::new(),
                    }),
            ],
        };
        let err = Registry::load(schema).unwrap_err();
        assert!(err.to_string().contains("Rewrite cycle"));
    }

    #[test]
    fn test_nested_relation_is_allowed() {
        let schema = SchemaDefinition {
            namespaces: vec![
                user_ns(),
                NamespaceDefinition::new("Group").with_relation(RelationDefinition::new(
                    "member",
                    vec![
                        SubjectTypeDefinition::namespace("User"),
                        SubjectTypeDefinition::subject_set("Group", "member"),
                    ],
                    "",
                )),
            ],
        };
        let registry = Registry::load(schema).unwrap();
        let rule = registry.resolve_rule("Group", "member").unwrap();
        assert!(rule.follows("member", "Group", "member"));
    }

    #[test]
    fn test_validate_tuple() {
        let registry = Registry::builtin().unwrap();

        let ok = RelationTuple::new("Role", "admin", "member", Subject::user("alice"));
        assert!(registry.validate_tuple(&ok).is_ok());

        let granted = RelationTuple::new(
            "Permission",
            "doc1",
            "granted",
            Subject::set("Role", "admin", "member"),
        );
        assert!(registry.validate_tuple(&granted).is_ok());

        let wrong_subject_type =
            RelationTuple::new("Permission", "doc1", "granted", Subject::user("alice"));
        assert!(registry.validate_tuple(&wrong_subject_type).is_err());

        let to_permission = RelationTuple::new("Permission", "doc1", "view", Subject::user("alice"));
        assert!(registry.validate_tuple(&to_permission).is_err());

        let unknown = RelationTuple::new("Role", "admin", "owner", Subject::user("alice"));
        assert!(matches!(
            registry.validate_tuple(&unknown),
            Err(RebacError::InvalidTuple(_))
        ));
    }
}
