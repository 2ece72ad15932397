use error_common::codes;
use thiserror::Error;

use crate::models::SnapshotToken;

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Write conflict on {tuple}: modified at snapshot {modified_at}, transaction based on {base}")]
    Conflict {
        tuple: String,
        base: SnapshotToken,
        modified_at: SnapshotToken,
    },

    #[error("Maximum traversal depth {max_depth} exceeded")]
    DepthExceeded { max_depth: u32 },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Consistency token invalid: {0}")]
    InvalidConsistencyToken(String),

    #[error("Snapshot {requested} expired, oldest readable snapshot is {watermark}")]
    SnapshotExpired {
        requested: SnapshotToken,
        watermark: SnapshotToken,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl RebacError {
    /// Stable error code for API responses and operator tooling
    pub fn code(&self) -> &'static str {
        match self {
            RebacError::InvalidSchema(_) => codes::schema::INVALID_SCHEMA,
            RebacError::InvalidTuple(_) | RebacError::InvalidSubject(_) => {
                codes::schema::INVALID_TUPLE
            }
            RebacError::NotFound(_) => codes::schema::NOT_FOUND,
            RebacError::Conflict { .. } => codes::write::CONFLICT,
            RebacError::DepthExceeded { .. } => codes::query::DEPTH_EXCEEDED,
            RebacError::Timeout { .. } => codes::query::TIMEOUT,
            RebacError::InvalidConsistencyToken(_) => codes::consistency::INVALID_TOKEN,
            RebacError::SnapshotExpired { .. } => codes::consistency::SNAPSHOT_EXPIRED,
            RebacError::InvalidConfig(_) => codes::config::INVALID_CONFIG,
            RebacError::StorageError(_) => codes::storage::STORAGE_FAILURE,
            RebacError::InternalError(_) => codes::storage::INTERNAL,
        }
    }

    /// Transient failures worth retrying at the storage boundary
    pub fn is_retryable(&self) -> bool {
        matches!(self, RebacError::StorageError(_))
    }
}

impl From<sqlx::Error> for RebacError {
    fn from(error: sqlx::Error) -> Self {
        RebacError::StorageError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
