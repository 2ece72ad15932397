use anyhow::Context;
use clap::Parser;
use ops_cli::{build_engine, execute, Cli, Settings};
use tracing::debug;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    logger_redacted::init(&settings.logging)?;
    debug!(config = %cli.config.display(), "Settings loaded");

    let database_url = cli.database_url.or(settings.database_url);
    let engine = build_engine(
        settings.engine,
        database_url.as_deref(),
        cli.schema.as_deref(),
        cli.tuples.as_deref(),
    )
    .await?;

    let output = execute(&engine, cli.command, cli.output).await?;
    if !output.is_empty() {
        println!("{}", output);
    }

    Ok(())
}
