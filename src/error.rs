//! Error types for MCP Fallback
//!
//! Library-level errors. Ordinary delivery failures never surface here: transports
//! and the fallback manager resolve them to a boolean. These variants cover startup,
//! configuration, and CLI plumbing.

use crate::protocol::TransportError;
use thiserror::Error;

/// Result type alias for MCP Fallback operations
pub type Result<T> = std::result::Result<T, FallbackError>;

/// Error type for MCP Fallback operations
#[derive(Error, Debug)]
pub enum FallbackError {
    /// Configuration errors (malformed config, registry misuse)
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport errors surfaced outside the send path
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}
