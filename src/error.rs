//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout docpool.
//! All errors are structured and map to stable error codes for JSON output.
//!
//! # Error Categories
//! - `InvalidUri`: Connection string could not be parsed
//! - `ConnectFailure`: Transport or handshake failure while opening a connection
//! - `TransportFailure`: Link dropped mid-exchange (connection becomes broken)
//! - `CommandFailure`: Server rejected a command
//! - `PartialInsertFailure`: Some documents of a batch insert were rejected
//! - `QueryFailure`: Count/find rejected by the server (e.g. malformed filter)
//! - `PoolExhausted`: Timed out waiting for a pooled connection
//! - `PoolClosed`: Pool has been shut down
//! - `InvalidInput`, `ConfigError`, `Serialization`: caller and environment errors
//!
//! Server-provided messages are carried verbatim.

use thiserror::Error;

/// Main error type for docpool operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocpoolError {
    /// Connection string is malformed
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Opening a connection failed (network or handshake)
    #[error("Connect failure: {0}")]
    ConnectFailure(String),

    /// Transport dropped during a request/response exchange
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Server reported a command error
    #[error("Command failed (code {code}): {message}")]
    CommandFailure { code: i32, message: String },

    /// Batch insert where the server rejected some documents
    #[error(
        "Partial insert failure: {succeeded} inserted, {} rejected: {message}",
        .failed_indices.len()
    )]
    PartialInsertFailure { succeeded: u64, failed_indices: Vec<usize>, message: String },

    /// Count or find rejected by the server
    #[error("Query failed: {0}")]
    QueryFailure(String),

    /// No connection became available before the acquire timeout
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    /// Pool was shut down
    #[error("Pool closed")]
    PoolClosed,

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (file not found, invalid JSON, etc.)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// BSON encoding or decoding error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DocpoolError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidUri(_) => "INVALID_URI",
            Self::ConnectFailure(_) => "CONNECT_FAILURE",
            Self::TransportFailure(_) => "TRANSPORT_FAILURE",
            Self::CommandFailure { .. } => "COMMAND_FAILURE",
            Self::PartialInsertFailure { .. } => "PARTIAL_INSERT_FAILURE",
            Self::QueryFailure(_) => "QUERY_FAILURE",
            Self::PoolExhausted(_) => "POOL_EXHAUSTED",
            Self::PoolClosed => "POOL_CLOSED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Get human-readable error message
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Whether the error means the transport can no longer be trusted
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure(_))
    }

    /// Create an invalid URI error
    pub fn invalid_uri(message: impl Into<String>) -> Self {
        Self::InvalidUri(message.into())
    }

    /// Create a connect failure error
    pub fn connect_failure(message: impl Into<String>) -> Self {
        Self::ConnectFailure(message.into())
    }

    /// Create a transport failure error
    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::TransportFailure(message.into())
    }

    /// Create a command failure error
    pub fn command_failure(code: i32, message: impl Into<String>) -> Self {
        Self::CommandFailure { code, message: message.into() }
    }

    /// Create a query failure error
    pub fn query_failure(message: impl Into<String>) -> Self {
        Self::QueryFailure(message.into())
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }
}

impl From<bson::ser::Error> for DocpoolError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for DocpoolError {
    fn from(err: bson::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for docpool operations
pub type Result<T> = std::result::Result<T, DocpoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DocpoolError::invalid_uri("test").error_code(), "INVALID_URI");
        assert_eq!(DocpoolError::connect_failure("test").error_code(), "CONNECT_FAILURE");
        assert_eq!(DocpoolError::transport_failure("test").error_code(), "TRANSPORT_FAILURE");
        assert_eq!(DocpoolError::command_failure(2, "test").error_code(), "COMMAND_FAILURE");
        assert_eq!(DocpoolError::query_failure("test").error_code(), "QUERY_FAILURE");
        assert_eq!(DocpoolError::pool_exhausted("test").error_code(), "POOL_EXHAUSTED");
        assert_eq!(DocpoolError::PoolClosed.error_code(), "POOL_CLOSED");
        assert_eq!(DocpoolError::invalid_input("test").error_code(), "INVALID_INPUT");
        assert_eq!(DocpoolError::config_error("test").error_code(), "CONFIG_ERROR");
        assert_eq!(DocpoolError::serialization("test").error_code(), "SERIALIZATION_ERROR");

        let partial = DocpoolError::PartialInsertFailure {
            succeeded: 1,
            failed_indices: vec![1],
            message: "dup".to_string(),
        };
        assert_eq!(partial.error_code(), "PARTIAL_INSERT_FAILURE");
    }

    #[test]
    fn test_server_message_preserved() {
        let err = DocpoolError::command_failure(26, "ns not found");
        assert!(err.message().contains("ns not found"));
        assert!(err.message().contains("26"));
    }

    #[test]
    fn test_partial_insert_message_counts() {
        let err = DocpoolError::PartialInsertFailure {
            succeeded: 8,
            failed_indices: vec![3, 7],
            message: "E11000 duplicate key error".to_string(),
        };
        let message = err.message();
        assert!(message.contains("8 inserted"));
        assert!(message.contains("2 rejected"));
        assert!(message.contains("E11000"));
    }

    #[test]
    fn test_only_transport_errors_are_transport() {
        assert!(DocpoolError::transport_failure("reset").is_transport());
        assert!(!DocpoolError::connect_failure("refused").is_transport());
        assert!(!DocpoolError::PoolClosed.is_transport());
    }
}
