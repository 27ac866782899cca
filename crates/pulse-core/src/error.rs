//! Error types for pulse.

use thiserror::Error;

/// Result type alias using pulse's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pulse operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Shared transport (notify channel, pub/sub broker, changefeed) unreachable
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Notify payload exceeds what the transport accepts
    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Authentication failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Forbidden (authenticated but not a member of the organization)
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

impl Error {
    /// Whether the failure came from the shared transport rather than the caller.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Database(_) | Error::Request(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_transport() {
        let err = Error::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "Transport error: connection refused");
    }

    #[test]
    fn test_error_display_payload_too_large() {
        let err = Error::PayloadTooLarge {
            size: 9000,
            limit: 7900,
        };
        assert_eq!(
            err.to_string(),
            "Payload too large: 9000 bytes (limit 7900)"
        );
    }

    #[test]
    fn test_error_display_invalid_input() {
        let err = Error::InvalidInput("empty organization id".to_string());
        assert_eq!(err.to_string(), "Invalid input: empty organization id");
    }

    #[test]
    fn test_error_display_forbidden() {
        let err = Error::Forbidden("not a member".to_string());
        assert_eq!(err.to_string(), "Forbidden: not a member");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_is_transport() {
        assert!(Error::Transport("down".into()).is_transport());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transport());
        assert!(!Error::InvalidInput("x".into()).is_transport());
        assert!(!Error::Config("x".into()).is_transport());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
