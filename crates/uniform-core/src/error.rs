//! Error types for the channel layer.
//!
//! Protocol, persistence and transport failures all surface through
//! [`ChannelError`]. Access-control denials in the exchange are not errors;
//! they come back as `None`/`false` from the storage API.

use thiserror::Error;

/// Main error type for channels, transports and storage.
#[derive(Debug, Error)]
pub enum ChannelError {
    // Protocol errors
    #[error("Request timeout: {action} on {path}")]
    Timeout { action: String, path: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Channel closed: {channel}")]
    Closed { channel: String },

    #[error("No route to channel: {target}")]
    NoRoute { target: String },

    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    // Reflection errors
    #[error("Target is not callable: {path}")]
    NotCallable { path: String },

    #[error("Target is not constructible: {path}")]
    NotConstructible { path: String },

    #[error("Module not found: {specifier}")]
    ModuleNotFound { specifier: String },

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for ChannelError {
    fn from(err: rusqlite::Error) -> Self {
        ChannelError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ChannelError {
    /// Build a timeout error naming the attempted action and path.
    pub fn timeout(action: impl std::fmt::Display, path: &[String]) -> Self {
        ChannelError::Timeout {
            action: action.to_string(),
            path: path.join("."),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Timeout or missing route
    /// - -32001: Remote execution failure
    /// - -32002: Channel closed
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            ChannelError::Timeout { .. } | ChannelError::NoRoute { .. } => -32000,

            ChannelError::Remote(_)
            | ChannelError::NotCallable { .. }
            | ChannelError::NotConstructible { .. }
            | ChannelError::ModuleNotFound { .. } => -32001,

            ChannelError::Closed { .. } => -32002,

            ChannelError::Validation { .. } | ChannelError::InvalidMessage { .. } => -32005,

            _ => -32603,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_names_action_and_path() {
        let err = ChannelError::timeout("apply", &["math".to_string(), "add".to_string()]);
        assert_eq!(err.to_string(), "Request timeout: apply on math.add");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(ChannelError::Remote("boom".into()).to_rpc_error_code(), -32001);
        assert_eq!(
            ChannelError::Closed {
                channel: "host".into()
            }
            .to_rpc_error_code(),
            -32002
        );
        assert_eq!(ChannelError::Other("x".into()).to_rpc_error_code(), -32603);
    }
}
