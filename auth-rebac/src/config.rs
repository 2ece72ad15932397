use crate::error::{RebacError, Result};
use error_common::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning knobs; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Traversal depth budget; the requested object is level 0
    pub max_depth: u32,
    /// Deadline for a check or expand without its own timeout
    pub request_timeout_ms: u64,
    pub cache_enabled: bool,
    /// Maximum cached check results
    pub cache_capacity: usize,
    /// Snapshots behind the head kept readable by compaction
    pub retained_versions: u64,
    /// Backoff for transient storage failures
    pub storage_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 25,
            request_timeout_ms: 5_000,
            cache_enabled: true,
            cache_capacity: 10_000,
            retained_versions: 0,
            storage_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(RebacError::InvalidConfig(
                "engine max_depth must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(RebacError::InvalidConfig(
                "engine request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
