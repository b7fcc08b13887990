use thiserror::Error;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, FurlongError>;

/// Errors that can occur in the message bus.
#[derive(Debug, Error)]
pub enum FurlongError {
    /// Bus configuration is missing or contradictory
    #[error("configuration error: {0}")]
    Config(String),

    /// Message failed a publish-time validity check
    #[error("validation error: {0}")]
    Validation(String),

    /// The underlying broker rejected an operation
    #[error("broker error: {0}")]
    Broker(String),

    /// An operation was attempted before `connect`
    #[error("broker is not connected")]
    NotConnected,

    /// JSON serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "rabbit")]
impl From<lapin::Error> for FurlongError {
    fn from(e: lapin::Error) -> Self {
        FurlongError::Broker(e.to_string())
    }
}
