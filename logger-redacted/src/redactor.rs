use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::LoggerConfig;

lazy_static! {
    static ref EMAIL_REGEX: Regex = Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
}

static REDACTION_ENABLED: AtomicBool = AtomicBool::new(true);
static HASH_FOR_CORRELATION: AtomicBool = AtomicBool::new(true);

/// Redaction settings for identifiers written to logs
#[derive(Debug, Clone, Copy)]
pub struct RedactionConfig {
    pub enabled: bool,
    pub hash_for_correlation: bool,
}

impl From<&LoggerConfig> for RedactionConfig {
    fn from(config: &LoggerConfig) -> Self {
        Self {
            enabled: config.redact_subjects,
            hash_for_correlation: config.hash_for_correlation,
        }
    }
}

/// Redactor for subject identifiers such as `User:alice` or `Role:admin#member`
///
/// The namespace prefix and any `#relation` suffix stay readable, only the
/// object identifier is replaced.
#[derive(Debug, Clone, Copy)]
pub struct IdentifierRedactor {
    config: RedactionConfig,
}

impl IdentifierRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    /// Redactor built from the process-wide settings installed by [`configure`]
    pub fn global() -> Self {
        Self::new(RedactionConfig {
            enabled: REDACTION_ENABLED.load(Ordering::Relaxed),
            hash_for_correlation: HASH_FOR_CORRELATION.load(Ordering::Relaxed),
        })
    }

    pub fn redact(&self, value: &str) -> String {
        if !self.config.enabled {
            return value.to_string();
        }

        let (namespace, rest) = match value.split_once(':') {
            Some((namespace, rest)) => (Some(namespace), rest),
            None => (None, value),
        };
        let (id, relation) = match rest.split_once('#') {
            Some((id, relation)) => (id, Some(relation)),
            None => (rest, None),
        };

        let masked = if self.config.hash_for_correlation {
            format!("ID[{}]", hash_value(id))
        } else if EMAIL_REGEX.is_match(id) {
            EMAIL_REGEX
                .replace_all(id, |caps: &regex::Captures| mask(&caps[0]))
                .to_string()
        } else {
            mask(id)
        };

        let mut out = String::with_capacity(masked.len() + value.len());
        if let Some(namespace) = namespace {
            out.push_str(namespace);
            out.push(':');
        }
        out.push_str(&masked);
        if let Some(relation) = relation {
            out.push('#');
            out.push_str(relation);
        }
        out
    }
}

/// Install process-wide redaction settings
pub fn configure(config: RedactionConfig) {
    REDACTION_ENABLED.store(config.enabled, Ordering::Relaxed);
    HASH_FOR_CORRELATION.store(config.hash_for_correlation, Ordering::Relaxed);
}

/// Redact an identifier with the process-wide settings
pub fn redact_identifier(value: &str) -> String {
    IdentifierRedactor::global().redact(value)
}

fn mask(value: &str) -> String {
    match value.chars().next() {
        Some(first) => format!("{first}***"),
        None => String::new(),
    }
}

fn hash_value(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    general_purpose::URL_SAFE_NO_PAD.encode(digest.get(..8).unwrap_or_default())
}
