//! Error types for the Tether synchronization core

use thiserror::Error;

/// Result type alias for Tether operations
pub type TetherResult<T> = Result<T, TetherError>;

/// Main error type for the synchronization core
///
/// Transport-level failures are recoverable by design: they are logged and
/// surfaced through the readiness signal staying unset, never by crashing
/// the host process.
#[derive(Error, Debug)]
pub enum TetherError {
    /// Push channel failed to open or closed unexpectedly
    #[error("Connection error: {0}")]
    Connection(String),

    /// The companion service endpoint could not be discovered
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A fetch-by-id call failed; the cached entry (if any) is kept stale
    #[error("Failed to resolve entity '{id}': {reason}")]
    Resolve {
        /// Identifier that failed to resolve
        id: String,
        /// Underlying failure description
        reason: String,
    },

    /// A push record could not be interpreted (e.g. missing its id field)
    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    /// HTTP-level failure on the pull path
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a discovery error
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a resolve error for a specific entity id
    pub fn resolve(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether a later retry (e.g. after `reconnect()`) may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Discovery(_) | Self::Http(_) | Self::Io(_)
        )
    }
}

impl From<reqwest::Error> for TetherError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TetherError::resolve("a1", "404 Not Found");
        assert_eq!(
            err.to_string(),
            "Failed to resolve entity 'a1': 404 Not Found"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TetherError::connection("refused").is_retryable());
        assert!(TetherError::discovery("no state file").is_retryable());
        assert!(!TetherError::config("bad endpoint").is_retryable());
        assert!(!TetherError::MalformedNotification("no id".into()).is_retryable());
    }
}
