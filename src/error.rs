//! Error types for the data-source resilience core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while initializing or running the core
///
/// Expected failure modes (cache misses, timeouts, exhausted retries) are
/// reported as values and never show up here. Only initialization and
/// unrecoverable plumbing failures are surfaced as `Error`.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reconnect attempt for a data source failed
    #[error("Reconnect to source {source_name} failed: {reason}")]
    ReconnectFailed { source_name: String, reason: String },

    /// Component was already shut down
    #[error("Component is shut down: {0}")]
    ShutDown(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a reconnect failure for `source_name`
    pub fn reconnect(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ReconnectFailed {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}
