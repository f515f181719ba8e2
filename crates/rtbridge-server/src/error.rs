//! Bridge error types.

use thiserror::Error;

/// Bridge errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Notification bus unreachable or rejected an operation.
    #[error("bus error: {0}")]
    Bus(String),

    /// Durable store unreachable or rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// Payload could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] rtbridge_proto::Error),

    /// A relay message reached a client this instance does not own.
    #[error("relay for client {client_id} delivered to the wrong channel")]
    WrongChannel { client_id: String },

    /// Attempted to relay a message to this instance's own channel.
    #[error("refusing to relay client {client_id} to own channel {channel_id}")]
    SelfRelay {
        client_id: String,
        channel_id: String,
    },

    /// Operation applied to the wrong kind of proxy.
    #[error("invalid proxy operation: {0}")]
    InvalidProxy(String),

    /// Schema or settings cache failure.
    #[error("schema cache error: {0}")]
    Schema(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A background loop panicked or was aborted.
    #[error("task error: {0}")]
    Task(String),
}

impl Error {
    /// Protocol invariant violations that must not be retried or masked.
    ///
    /// An unknown control event type means peers run an incompatible
    /// version; a misrouted relay means routing state is corrupt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(rtbridge_proto::Error::UnknownEventType(_))
                | Error::WrongChannel { .. }
                | Error::SelfRelay { .. }
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(err.to_string())
    }
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;
