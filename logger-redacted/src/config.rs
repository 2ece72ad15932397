// Logger configuration
use serde::{Deserialize, Serialize};

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored when attached to a terminal
    Pretty,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub log_level: String,
    pub format: LogFormat,
    /// Redact subject identifiers recorded in log fields
    pub redact_subjects: bool,
    /// Replace redacted values with a stable hash instead of a mask
    pub hash_for_correlation: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Pretty,
            redact_subjects: true,
            hash_for_correlation: true,
        }
    }
}
