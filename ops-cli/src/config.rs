use auth_rebac::EngineConfig;
use config_engine::{ConfigError, ConfigLoader};
use logger_redacted::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// CLI settings: `engine`, `logging` and an optional `database_url`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub logging: LoggerConfig,
    pub database_url: Option<String>,
}

impl Settings {
    /// Defaults, then `path` when it exists, then `REBAC_*` variables
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings: Self = ConfigLoader::new().with_file(path).load()?;
        settings
            .engine
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load(Path::new("does-not-exist.yaml")).unwrap();
        assert_eq!(settings.engine.max_depth, 25);
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "engine:\n  max_depth: 6\n  cache_enabled: false\nlogging:\n  format: json\n"
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.engine.max_depth, 6);
        assert!(!settings.engine.cache_enabled);
        assert_eq!(settings.engine.request_timeout_ms, 5_000);
        assert_eq!(settings.logging.format, logger_redacted::LogFormat::Json);
    }

    #[test]
    fn test_invalid_engine_settings_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "engine:\n  max_depth: 0\n").unwrap();

        let err = Settings::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
