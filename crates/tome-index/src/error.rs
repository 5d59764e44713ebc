//! Error types for index operations.

use thiserror::Error;

/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur while building, loading or querying an index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A vector does not match the dimension already held by the index.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Keys and vectors supplied together differ in length.
    #[error("Length mismatch: {keys} keys but {embeddings} embeddings")]
    LengthMismatch { keys: usize, embeddings: usize },

    /// The key is already present in the graph.
    #[error("Duplicate key: {0:?}")]
    DuplicateKey(String),

    /// A graph node has no stored vector.
    #[error("Missing embedding for graph node {0:?}")]
    MissingEmbedding(String),

    /// The snapshot names an entry point that is not in its top layer.
    #[error("Entry point {0:?} is not present in the top graph layer")]
    UnknownEntryPoint(String),

    /// The snapshot has graph layers but no entry point.
    #[error("Snapshot has graph layers but no entry point")]
    MissingEntryPoint,

    /// A vector with no components was supplied.
    #[error("Empty vector for key {0:?}")]
    EmptyVector(String),

    /// Snapshot (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
