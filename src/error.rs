//! CodeGuard error types.
//!
//! # Error Classification
//!
//! Only hard failures are errors. Ordinary findings travel in-band:
//!
//! - **Hard failures** (`Err`): malformed or oversized content handed to a
//!   validator, malformed analysis results, unknown discipline keys, bad
//!   configuration, transport faults.
//! - **In-band verdicts** (`Ok`): threats below the blocking threshold,
//!   quarantine decisions and emergency-shutdown blocks. Callers must always
//!   inspect the returned verdict; there is no fail-open default.
//!
//! Capacity and connection errors on the real-time channel surface to peers
//! as close frames, not as errors returned to application code.

use thiserror::Error;

/// CodeGuard errors.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Content or result failed a structural check.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown discipline key or inconsistent security setup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Broadcast server is at its connection limit.
    #[error("Server at capacity ({max} connections)")]
    Capacity {
        /// Configured connection limit.
        max: usize,
    },

    /// Real-time transport failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unparseable or unexpected real-time envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration file or environment could not be loaded.
    #[error("Config error: {0}")]
    Config(String),

    /// Server-side error.
    #[error("Server error: {0}")]
    Server(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for CodeGuard operations
pub type Result<T> = std::result::Result<T, GuardError>;

impl From<toml::de::Error> for GuardError {
    fn from(err: toml::de::Error) -> Self {
        GuardError::Config(err.to_string())
    }
}

impl From<regex::Error> for GuardError {
    fn from(err: regex::Error) -> Self {
        GuardError::Configuration(format!("Invalid pattern: {err}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GuardError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GuardError::Connection(err.to_string())
    }
}
