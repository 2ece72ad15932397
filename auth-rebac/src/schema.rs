use crate::error::{RebacError, Result};
use serde::{Deserialize, Serialize};

/// Namespace schema definition as loaded from YAML or JSON
///
/// This is the declarative, uncompiled form. [`crate::Registry::load`]
/// validates it and compiles it into rewrite rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub namespaces: Vec<NamespaceDefinition>,
}

impl SchemaDefinition {
    pub fn from_yaml(source: &str) -> Result<Self> {
        serde_yaml::from_str(source).map_err(|e| RebacError::InvalidSchema(e.to_string()))
    }

    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|e| RebacError::InvalidSchema(e.to_string()))
    }

    /// Role/Permission model: users hold permissions directly or through
    /// membership of a role the permission is granted to.
    pub fn role_permission_model() -> Self {
        Self {
            namespaces: vec![
                NamespaceDefinition::new("User"),
                NamespaceDefinition::new("Role").with_relation(RelationDefinition::new(
                    "member",
                    vec![SubjectTypeDefinition::namespace("User")],
                    "Users who are members of this role",
                )),
                NamespaceDefinition::new("Permission")
                    .with_relation(RelationDefinition::new(
                        "holder",
                        vec![SubjectTypeDefinition::namespace("User")],
                        "Users who hold this permission directly",
                    ))
                    .with_relation(RelationDefinition::new(
                        "granted",
                        vec![SubjectTypeDefinition::subject_set("Role", "member")],
                        "Roles this permission is granted to",
                    ))
                    .with_permission(PermissionDefinition {
                        name: "view".to_string(),
                        union: vec![
                            OperandDefinition::Direct {
                                relation: "holder".to_string(),
                            },
                            OperandDefinition::SubjectSet {
                                relation: "granted".to_string(),
                                namespace: "Role".to_string(),
                                target: "member".to_string(),
                            },
                        ],
                        description: "Direct holders or members of a granted role".to_string(),
                    }),
            ],
        }
    }
}

/// Definition of a namespace (object type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    pub name: String,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    #[serde(default)]
    pub permissions: Vec<PermissionDefinition>,
}

impl NamespaceDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            relations: Vec::new(),
            permissions: Vec::new(),
        }
    }

    pub fn with_relation(mut self, relation: RelationDefinition) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn with_permission(mut self, permission: PermissionDefinition) -> Self {
        self.permissions.push(permission);
        self
    }
}

/// Definition of a stored relation within a namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    /// Subjects tuples on this relation may reference
    pub subject_types: Vec<SubjectTypeDefinition>,
    #[serde(default)]
    pub description: String,
}

impl RelationDefinition {
    pub fn new(name: &str, subject_types: Vec<SubjectTypeDefinition>, description: &str) -> Self {
        Self {
            name: name.to_string(),
            subject_types,
            description: description.to_string(),
        }
    }
}

/// `{ namespace: User }` or `{ namespace: Role, relation: member }`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectTypeDefinition {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

impl SubjectTypeDefinition {
    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            relation: None,
        }
    }

    pub fn subject_set(namespace: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            relation: Some(relation.to_string()),
        }
    }
}

/// Computed permission: the union of its operands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub name: String,
    pub union: Vec<OperandDefinition>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperandDefinition {
    /// Subject stored directly on `relation`
    Direct { relation: String },
    /// Subject is a member of a `namespace#target` subject set stored on `relation`
    SubjectSet {
        relation: String,
        namespace: String,
        target: String,
    },
}
