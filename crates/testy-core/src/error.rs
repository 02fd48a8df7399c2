use std::time::Duration;

use thiserror::Error;

/// Core error type for testy fixtures.
#[derive(Error, Debug)]
pub enum TestyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Timed out after {waited:?}: {message}")]
    Timeout { waited: Duration, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TestyError {
    /// Build a timeout error for a wait that lasted `waited`.
    pub fn timeout(waited: Duration, message: impl Into<String>) -> Self {
        TestyError::Timeout {
            waited,
            message: message.into(),
        }
    }

    /// Whether this error came from an exhausted wait bound.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TestyError::Timeout { .. })
    }
}

/// Result type alias using TestyError.
pub type Result<T> = std::result::Result<T, TestyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = TestyError::timeout(Duration::from_millis(500), "3 of 5 messages received");
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Timed out after 500ms: 3 of 5 messages received"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TestyError = io.into();
        assert!(matches!(err, TestyError::Io(_)));
        assert!(!err.is_timeout());
    }
}
