use crate::cli::{Command, OutputFormat};
use auth_rebac::{
    AuthorizationEngine, CheckRequest, EngineConfig, ExpandRequest, InMemoryTupleStore,
    PostgresTupleStore, RebacError, Registry, RelationTuple, SchemaDefinition, SnapshotToken,
    Subject, SubjectSet, SubjectTree, TreeNodeType, TupleOp, TupleQuery, TupleStore,
};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid target '{0}': expected namespace:object#relation")]
    InvalidTarget(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid tuple on line {line}: {source}")]
    Seed { line: usize, source: RebacError },

    #[error(transparent)]
    Engine(#[from] RebacError),

    #[error("Failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
}

fn read_file(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse `namespace:object#relation`
pub fn parse_target(target: &str) -> Result<SubjectSet, CliError> {
    match target.parse::<Subject>() {
        Ok(Subject::Set(set)) => Ok(set),
        _ => Err(CliError::InvalidTarget(target.to_string())),
    }
}

/// Schema definition from a `.json` file, or YAML otherwise
pub fn load_schema_file(path: &Path) -> Result<SchemaDefinition, CliError> {
    let source = read_file(path)?;
    let definition = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => SchemaDefinition::from_json(&source)?,
        _ => SchemaDefinition::from_yaml(&source)?,
    };
    Ok(definition)
}

/// Tuples in string form, one per line; blank lines and lines starting
/// with `#` are skipped
pub fn parse_tuples(source: &str) -> Result<Vec<RelationTuple>, CliError> {
    source
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line, text)| {
            text.parse::<RelationTuple>()
                .map_err(|source| CliError::Seed { line, source })
        })
        .collect()
}

/// Build the engine for a CLI invocation: PostgreSQL when a database URL is
/// configured, otherwise an in-memory store seeded from `tuples`
pub async fn build_engine(
    config: EngineConfig,
    database_url: Option<&str>,
    schema: Option<&Path>,
    tuples: Option<&Path>,
) -> Result<AuthorizationEngine, CliError> {
    let registry = match schema {
        Some(path) => Registry::load(load_schema_file(path)?)?,
        None => Registry::builtin()?,
    };

    let store: Arc<dyn TupleStore> = match database_url {
        Some(url) => {
            let store = PostgresTupleStore::from_connection_string(url).await?;
            store.migrate().await?;
            info!("Using PostgreSQL tuple store");
            Arc::new(store)
        }
        None => Arc::new(InMemoryTupleStore::new()),
    };

    let engine = AuthorizationEngine::with_config(store, registry, config)?;

    if let Some(path) = tuples {
        let seed = parse_tuples(&read_file(path)?)?;
        let count = seed.len();
        engine
            .write_relation_tuples(seed.into_iter().map(TupleOp::insert).collect())
            .await?;
        info!(count, path = %path.display(), "Seeded tuples");
    }

    Ok(engine)
}

fn render<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce() -> String) -> Result<String, CliError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Text => Ok(text()),
    }
}

fn render_tree(tree: &SubjectTree, indent: usize, out: &mut String) {
    let marker = match tree.node_type {
        TreeNodeType::Union => "∪",
        TreeNodeType::Leaf => "•",
    };
    out.push_str(&format!("{}{} {}\n", "  ".repeat(indent), marker, tree.subject));
    for child in &tree.children {
        render_tree(child, indent + 1, out);
    }
}

fn lines<T: std::fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
}

/// Run one command and return its rendered output
pub async fn execute(
    engine: &AuthorizationEngine,
    command: Command,
    format: OutputFormat,
) -> Result<String, CliError> {
    match command {
        Command::ValidateSchema { file } => {
            let registry = Registry::load(load_schema_file(&file)?)?;
            let mut namespaces: Vec<&str> = registry.namespaces().collect();
            namespaces.sort_unstable();
            render(format, &namespaces, || {
                format!(
                    "{} schema is valid: {} namespaces ({})",
                    "✔".green(),
                    namespaces.len(),
                    namespaces.join(", ")
                )
            })
        }

        Command::Write { tuples } => {
            let ops = tuples
                .iter()
                .map(|t| t.parse().map(TupleOp::insert))
                .collect::<Result<Vec<_>, RebacError>>()?;
            let response = engine.write_relation_tuples(ops).await?;
            render(format, &response, || {
                format!("{} committed at snapshot {}", "✔".green(), response.snapshot)
            })
        }

        Command::Delete { tuples } => {
            let ops = tuples
                .iter()
                .map(|t| t.parse().map(TupleOp::delete))
                .collect::<Result<Vec<_>, RebacError>>()?;
            let response = engine.write_relation_tuples(ops).await?;
            render(format, &response, || {
                format!("{} committed at snapshot {}", "✔".green(), response.snapshot)
            })
        }

        Command::Check {
            target,
            subject,
            snapshot,
        } => {
            let target = parse_target(&target)?;
            let mut request = CheckRequest::new(
                &target.namespace,
                &target.object,
                &target.relation,
                subject.parse()?,
            );
            request.snapshot = snapshot.map(SnapshotToken);

            let response = engine.check(request).await?;
            render(format, &response, || {
                let verdict = if response.allowed {
                    "allowed".green()
                } else {
                    "denied".red()
                };
                format!("{} (snapshot {})", verdict, response.snapshot)
            })
        }

        Command::Expand {
            target,
            snapshot,
            max_depth,
            tree,
        } => {
            let target = parse_target(&target)?;
            let mut request = ExpandRequest::new(&target.namespace, &target.object, &target.relation);
            request.snapshot = snapshot.map(SnapshotToken);
            request.max_depth = max_depth;

            if tree {
                let response = engine.expand(request).await?;
                render(format, &response, || {
                    let mut out = String::new();
                    render_tree(&response.tree, 0, &mut out);
                    format!("{}snapshot {}", out, response.snapshot)
                })
            } else {
                let response = engine.expand_subjects(request).await?;
                render(format, &response, || lines(&response.subjects))
            }
        }

        Command::List {
            namespace,
            object,
            relation,
            subject,
            snapshot,
        } => {
            let query = TupleQuery {
                namespace,
                object,
                relation,
                subject: subject.map(|s| s.parse()).transpose()?,
            };
            let tuples = engine.read_tuples(query, snapshot.map(SnapshotToken)).await?;
            render(format, &tuples, || lines(&tuples))
        }

        Command::ListObjects {
            namespace,
            permission,
            subject,
            snapshot,
        } => {
            let objects = engine
                .list_objects(
                    &namespace,
                    &permission,
                    subject.parse()?,
                    snapshot.map(SnapshotToken),
                )
                .await?;
            render(format, &objects, || lines(&objects))
        }

        Command::Compact => {
            let report = engine.compact().await?;
            render(format, &report, || {
                format!(
                    "{} watermark {}, removed {} tuple versions",
                    "✔".green(),
                    report.watermark,
                    report.removed
                )
            })
        }
    }
}
