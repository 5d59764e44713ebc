//! Error types for the retrieval service.

use thiserror::Error;
use tome_index::IndexError;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur in the retrieval service.
#[derive(Debug, Error)]
pub enum RagError {
    /// Error loading or running the embedding model.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Error from the vector index.
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Error talking to the host bridge.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP/network error.
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for RagError {
    fn from(e: reqwest::Error) -> Self {
        RagError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for RagError {
    fn from(e: std::io::Error) -> Self {
        RagError::Internal(e.to_string())
    }
}
