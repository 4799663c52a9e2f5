//! Error types shared across the workspace.

use thiserror::Error;

/// Result type for Canopy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Workspace-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration fault, qualified with the offending field.
    #[error("invalid value for '{field}': {message}")]
    Config { field: String, message: String },

    /// Transport fault (MQTT publish, serial read). Recovered locally by the
    /// caller; never escalated into a hard failure of the control loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a field-qualified configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
