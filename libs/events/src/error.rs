//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding or encoding events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The line was empty or whitespace only.
    #[error("empty event line")]
    Empty,

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            EventError::InvalidPayload(err.to_string())
        } else {
            EventError::Serialization(err.to_string())
        }
    }
}
