//! Operations CLI for the ReBAC engine
//!
//! The `rebac` binary validates namespace schemas, writes and deletes
//! relation tuples, and runs checks and expansions against either a
//! PostgreSQL store or an in-memory store seeded from a tuples file.

pub mod cli;
pub mod commands;
pub mod config;

pub use cli::{Cli, Command, OutputFormat};
pub use commands::{build_engine, execute, CliError};
pub use config::Settings;
