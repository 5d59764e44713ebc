//! tome-rag: retrieval service and host bridge
//!
//! This crate wires an embedding model to a `tome-index` HNSW index:
//! - Embedder abstraction with local ONNX, Ollama and hashing backends
//! - Document retrieval and prompt assembly for a host application
//! - Dataset import from the host through a pluggable bridge
//! - An axum HTTP server exposing the same operations

pub mod bridge;
pub mod document;
pub mod embedding;
pub mod error;
pub mod events;
pub mod ollama;
pub mod onnx;
pub mod server;
pub mod service;

pub use bridge::{Bridge, FileBridge, MemoryBridge, SharedBridge};
pub use document::{Document, documents_from_result, format_prompt, with_context};
pub use embedding::{
    Embedder, HashEmbedder, LazyEmbedder, LoggingEmbedder, SharedEmbedder, mean_pool,
    normalize_l2, with_retry,
};
pub use error::{RagError, Result};
pub use events::{EventHub, RetrievalEvent};
pub use ollama::{OllamaConfig, OllamaEmbedder};
pub use onnx::{DEFAULT_MODEL_ID, ModelDtype, ModelPaths, OnnxConfig};
#[cfg(feature = "onnx")]
pub use onnx::{OnnxEmbedder, lazy_onnx_embedder};
pub use server::{BridgeServer, DEFAULT_PORT, ServerConfig, ServerError};
pub use service::{
    DEFAULT_TOP_K, ImportOutcome, IndexStats, Retrieval, RetrievalConfig, RetrievalService,
    build_dataset,
};
