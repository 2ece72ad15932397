//! Relationship-based permission check engine
//!
//! This crate stores relation tuples (subject-relation-object facts) and
//! answers "does subject S hold permission P on object O?" by walking the
//! relation graph, including indirect grants through role membership.
//!
//! # Core Concepts
//!
//! - **Relation tuple**: `namespace:object#relation@subject`, e.g.
//!   `Role:admin#member@User:alice`
//! - **Subject set**: a subject that stands for every holder of a relation
//!   on another object, e.g. `Role:admin#member`
//! - **Rewrite rule**: the union of direct and subject-set operands that
//!   defines a permission
//! - **Snapshot token**: the logical version minted by every committed write;
//!   reads pinned to a token see exactly the writes committed at or before it
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{AuthorizationEngine, CheckRequest, RelationTuple, Subject, TupleOp};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthorizationEngine::in_memory()?;
//!
//!     engine
//!         .write_relation_tuples(vec![
//!             TupleOp::insert(RelationTuple::new(
//!                 "Permission",
//!                 "doc1",
//!                 "granted",
//!                 Subject::set("Role", "admin", "member"),
//!             )),
//!             TupleOp::insert(RelationTuple::new("Role", "admin", "member", Subject::user("alice"))),
//!         ])
//!         .await?;
//!
//!     let response = engine
//!         .check(CheckRequest::new("Permission", "doc1", "view", Subject::user("alice")))
//!         .await?;
//!     assert!(response.allowed);
//!
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod config;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod expand;
pub mod models;
pub mod registry;
pub mod repository;
pub mod schema;

pub use config::EngineConfig;
pub use engine::*;
pub use error::*;
pub use error_common::RetryPolicy;
pub use models::*;
pub use registry::{Registry, RelationKind, RewriteRule, RuleOperand};
pub use repository::{InMemoryTupleStore, PostgresTupleStore, RetryingStore, TupleStore};
pub use schema::*;
