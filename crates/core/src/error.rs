//! Domain errors surfaced to the visitor-facing request path.
//!
//! Bridge failures never show up here: the dispatcher logs and swallows them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// The requester does not own the message it tries to change.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The target exists but cannot take this transition (e.g. editing a
    /// deleted message).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Backend failure, passed through unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Refused by the IP or User-Agent filter, or by the version gate.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Error raised by a [`crate::store::MessageStore`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage lock poisoned")]
    Poisoned,

    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SessionNotFound(_) => "session_not_found",
            Error::MessageNotFound(_) => "message_not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::InvalidState(_) => "invalid_state",
            Error::Validation(_) => "validation_error",
            Error::Storage(_) => "storage_error",
            Error::Rejected(_) => "rejected",
        }
    }
}
