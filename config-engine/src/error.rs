use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration source not found: {0}")]
    SourceNotFound(String),
    
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),
    
    #[error("Configuration parsing failed: {0}")]
    ParseError(String),
    
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        ConfigError::ParseError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
