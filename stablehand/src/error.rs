use thiserror::Error;
use uuid::Uuid;

use crate::requests::RequestStatus;

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, StablehandError>;

/// Errors that can occur while processing game-action requests.
///
/// The `Display` text of `NotFound` and `Invariant` is persisted verbatim as
/// the request row's failure reason, where the front-end API surfaces it.
#[derive(Debug, Error)]
pub enum StablehandError {
    /// Referenced entity (horse, sire, dam, feeding, ...) does not exist
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// Message or configuration failed a validity check
    #[error("validation error: {0}")]
    Validation(String),

    /// A domain rule was violated; not retried automatically
    #[error("{0}")]
    Invariant(String),

    /// A request row was in a state the operation does not accept
    #[error("request {0} is {1:?}, expected {2}")]
    InvalidState(Uuid, RequestStatus, &'static str),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Message bus operation failed
    #[error("message bus error: {0}")]
    Bus(#[from] furlong::FurlongError),

    /// Processing was cancelled by host shutdown
    #[error("operation cancelled")]
    Cancelled,

    /// Worker configuration is missing or contradictory
    #[error("configuration error: {0}")]
    Config(String),
}

impl StablehandError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        StablehandError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        StablehandError::Invariant(message.into())
    }
}
