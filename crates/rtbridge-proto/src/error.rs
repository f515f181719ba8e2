//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload did not have the expected shape (field count, JSON body).
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Control event type this build does not understand.
    #[error("unknown control event type: {0}")]
    UnknownEventType(String),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
