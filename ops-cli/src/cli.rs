use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rebac")]
#[command(about = "Operate the ReBAC engine: validate schemas, write tuples, check and expand permissions")]
pub struct Cli {
    /// Settings file (YAML or TOML); REBAC_* environment variables override it
    #[arg(short, long, default_value = "rebac.yaml")]
    pub config: PathBuf,

    /// PostgreSQL connection URL; the in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Namespace schema (YAML or JSON); the built-in role/permission model when absent
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Seed tuples, one `namespace:object#relation@subject` per line
    #[arg(long)]
    pub tuples: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Compile a schema file and report its namespaces
    ValidateSchema {
        /// Schema file to validate
        file: PathBuf,
    },

    /// Insert tuples in one transaction
    Write {
        /// Tuples in `namespace:object#relation@subject` form
        #[arg(required = true)]
        tuples: Vec<String>,
    },

    /// Delete tuples in one transaction
    Delete {
        #[arg(required = true)]
        tuples: Vec<String>,
    },

    /// Check whether a subject holds a permission
    Check {
        /// `namespace:object#permission`
        target: String,
        /// `namespace:id` or `namespace:object#relation`
        subject: String,
        #[arg(long)]
        snapshot: Option<u64>,
    },

    /// Expand a relation or permission into its subjects
    Expand {
        /// `namespace:object#relation`
        target: String,
        #[arg(long)]
        snapshot: Option<u64>,
        #[arg(long)]
        max_depth: Option<u32>,
        /// Print the resolution tree instead of the flattened subjects
        #[arg(long)]
        tree: bool,
    },

    /// List stored tuples matching a filter
    List {
        namespace: String,
        #[arg(long)]
        object: Option<String>,
        #[arg(long)]
        relation: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        snapshot: Option<u64>,
    },

    /// List objects of a namespace on which a subject holds a permission
    ListObjects {
        namespace: String,
        permission: String,
        subject: String,
        #[arg(long)]
        snapshot: Option<u64>,
    },

    /// Drop tuple versions no readable snapshot can observe
    Compact,
}
