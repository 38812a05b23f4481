//! Error types for configuration, provisioning and forwarding

use crate::config::{Phase, RequiredField};
use crate::session::SessionKey;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving the deployment configuration.
///
/// Always terminal: nothing is provisioned once one of these is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// One or more required values could not be resolved from any source.
    ///
    /// When the passphrase is among them, `passphrase_suggestion` carries a
    /// freshly generated value the operator may choose to set.
    #[error("{}", missing_message(.fields))]
    Missing {
        fields: Vec<RequiredField>,
        passphrase_suggestion: Option<String>,
    },

    /// `.env` exists but could not be read or parsed.
    #[error("failed to load {}: {source}", .path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("TO_ROUTE must be an absolute URL, got {value:?}: {reason}")]
    InvalidDestination { value: String, reason: String },
}

fn missing_message(fields: &[RequiredField]) -> String {
    fields
        .iter()
        .map(|field| {
            format!(
                "{} is not set. Provide with --{} or in .env file",
                field.env_var(),
                field.flag()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Failures from the provisioning engine or the state it records into.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("failed to encode resource record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("passphrase does not match the one recorded for {0}")]
    PassphraseMismatch(SessionKey),

    #[error("session for {0} was opened read-only")]
    ReadOnly(SessionKey),

    #[error("engine rejected {resource}: {reason}")]
    Rejected { resource: String, reason: String },
}

/// A lifecycle phase failed against the provisioning engine.
#[derive(Error, Debug)]
#[error("{phase} failed for {key}: {source}")]
pub struct ProvisionError {
    pub phase: Phase,
    pub key: SessionKey,
    #[source]
    pub source: EngineError,
}

impl ProvisionError {
    pub fn new(phase: Phase, key: SessionKey, source: EngineError) -> Self {
        Self { phase, key, source }
    }
}

/// A single forwarded request failed. Scoped to that request only.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("invalid TO_ROUTE {value:?}: {source}")]
    InvalidDestination {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("upstream fetch to {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}
