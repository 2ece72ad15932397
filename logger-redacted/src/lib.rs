pub mod config;
pub mod redactor;

pub use config::*;
pub use redactor::*;

use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logging setup with redaction of subject identifiers
/// 
/// Authorization engines log who asked for what. Subject identifiers are
/// user identifiers, so every log field carrying one goes through
/// [`redact_identifier`] before it is recorded.
/// 
/// # Key Features
/// 
/// - **Env-driven Filtering**: `RUST_LOG` wins, the configured level is the fallback
/// - **Pretty or JSON Output**: human-readable for development, JSON for collectors
/// - **Hash-based Correlation**: redacted values stay correlatable across events
/// 
/// # Example
/// 
/// ```rust,no_run
/// use logger_redacted::{init, redact_identifier, LoggerConfig};
/// 
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     init(&LoggerConfig::default())?;
///     tracing::info!(subject = %redact_identifier("User:alice"), "Check allowed");
///     // subject=User:ID[...]
///     Ok(())
/// }
/// ```
/// 
/// # Configuration
/// 
/// ```yaml
/// logging:
///   log_level: info
///   format: json
///   redact_subjects: true
///   hash_for_correlation: true
/// ```
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Install the global tracing subscriber and redaction settings
pub fn init(config: &LoggerConfig) -> Result<(), LoggerError> {
    redactor::configure(RedactionConfig::from(config));

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|_| LoggerError::InvalidFilter(config.log_level.clone()))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|e| LoggerError::AlreadyInstalled(e.to_string()))
}
