//! Error types for Alivio Sensory

use thiserror::Error;

/// Errors surfaced at parse boundaries (FFI, CLI, config loading).
///
/// Playback never returns these; backend failures are swallowed through
/// [`crate::failure::FailureLog`] instead.
#[derive(Debug, Error)]
pub enum SensoryError {
    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown value for {field}: {value}")]
    UnknownValue { field: &'static str, value: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Failures reported by a platform haptic or audio backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to load track {track}: {reason}")]
    Asset { track: String, reason: String },

    #[error("Primitive failed: {0}")]
    Primitive(String),

    #[error("Unsupported primitive: {0}")]
    Unsupported(&'static str),
}
