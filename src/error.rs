//! Error Module
//!
//! Defines error types and result types used throughout the edge node.

use thiserror::Error;

/// Main error type for the edge node
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Journal error: {0}")]
    JournalError(String),

    #[error("Journal header mismatch: expected [{expected}], found [{found}]")]
    HeaderMismatch { expected: String, found: String },

    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    #[error("Cache is closed")]
    CacheClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Coordinator error: {0}")]
    CoordinatorError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for NodeError {
    fn from(err: hyper::Error) -> Self {
        NodeError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for NodeError {
    fn from(err: serde_yaml::Error) -> Self {
        NodeError::SerializationError(err.to_string())
    }
}

/// Result type alias for the edge node
pub type Result<T> = std::result::Result<T, NodeError>;
