use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment prefix used when none is configured
pub const DEFAULT_ENV_PREFIX: &str = "REBAC_";

/// Builder that merges configuration sources in priority order:
/// defaults, then the optional file, then prefixed environment variables.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    require_file: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            require_file: false,
        }
    }

    /// Read a YAML or TOML file, picked by extension
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Fail instead of skipping when the file does not exist
    pub fn require_file(mut self, required: bool) -> Self {
        self.require_file = required;
        self
    }

    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = prefix.to_string();
        self
    }

    /// Merge all sources on top of `T::default()` and extract `T`
    pub fn load<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        self.figment::<T>()?.extract().map_err(ConfigError::from)
    }

    fn figment<T>(&self) -> Result<Figment>
    where
        T: Serialize + Default,
    {
        let mut figment = Figment::from(Serialized::defaults(T::default()));

        if let Some(path) = &self.file {
            if path.exists() {
                debug!(path = %path.display(), "Loading configuration file");
                figment = match path.extension().and_then(|ext| ext.to_str()) {
                    Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                    Some("toml") => figment.merge(Toml::file(path)),
                    other => {
                        return Err(ConfigError::UnsupportedFormat(
                            other.unwrap_or("<none>").to_string(),
                        ))
                    }
                };
            } else if self.require_file {
                return Err(ConfigError::SourceNotFound(path.display().to_string()));
            }
        }

        Ok(figment.merge(Env::prefixed(&self.env_prefix).split("__")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Nested {
        depth: u32,
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Settings {
        name: String,
        nested: Nested,
    }

    #[test]
    fn test_file_then_env_precedence() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("settings.yaml", "name: from-file\nnested:\n  depth: 7\n")?;
            jail.set_env("TEST_NESTED__DEPTH", "9");

            let settings: Settings = ConfigLoader::new()
                .with_file("settings.yaml")
                .with_env_prefix("TEST_")
                .load()
                .map_err(|e| e.to_string())?;

            assert_eq!(settings.name, "from-file");
            assert_eq!(settings.nested.depth, 9);
            Ok(())
        });
    }

    #[test]
    fn test_missing_optional_file_uses_defaults() {
        figment::Jail::expect_with(|_jail| {
            let settings: Settings = ConfigLoader::new()
                .with_file("absent.yaml")
                .with_env_prefix("UNUSED_PREFIX_")
                .load()
                .map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_missing_required_file_fails() {
        let result: Result<Settings> = ConfigLoader::new()
            .with_file("/definitely/not/here.yaml")
            .require_file(true)
            .load();
        assert!(matches!(result, Err(ConfigError::SourceNotFound(_))));
    }
}
