//! tome-index: approximate nearest-neighbor index
//!
//! This crate provides the vector index behind tome's retrieval service:
//! - An HNSW graph over string keys with cosine distances
//! - Snapshot export/import compatible with mememo's `exportIndex` JSON
//! - The importable dataset format (graph + keys + embeddings)

pub mod distance;
pub mod error;
pub mod hnsw;
pub mod snapshot;

pub use distance::{DistanceFunction, cosine_distance};
pub use error::{IndexError, Result};
pub use hnsw::{DEFAULT_EF_CONSTRUCTION, DEFAULT_M, Hnsw, HnswConfig, QueryResult};
pub use snapshot::{Dataset, GraphLayer, IndexSnapshot};
