//! Serialized forms of the index.
//!
//! [`IndexSnapshot`] is the graph-only export (`exportIndex` in the host's
//! JavaScript tooling). [`Dataset`] bundles a snapshot with the keys and
//! embeddings it was built from, positionally aligned.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::distance::DistanceFunction;
use crate::error::Result;
use crate::hnsw::{DEFAULT_EF_CONSTRUCTION, DEFAULT_M, Hnsw};

/// One graph layer: node key → (neighbor key → distance).
pub type GraphLayer = HashMap<String, HashMap<String, f32>>;

/// Exported graph structure and construction parameters.
///
/// Layer 0 is the bottom layer and holds every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexSnapshot {
    pub distance_function_type: DistanceFunction,
    pub m: usize,
    pub ef_construction: usize,
    pub m_max0: usize,
    pub ml: f64,
    /// Level generator seed. Stored as a JSON number, which may be fractional.
    pub seed: f64,
    #[serde(rename = "useIndexedDB")]
    pub use_indexed_db: bool,
    pub entry_point_key: Option<String>,
    pub graph_layers: Vec<GraphLayer>,
}

impl Default for IndexSnapshot {
    fn default() -> Self {
        Self {
            distance_function_type: DistanceFunction::Cosine,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            m_max0: DEFAULT_M * 2,
            ml: 1.0 / (DEFAULT_M as f64).ln(),
            seed: 0.0,
            use_indexed_db: false,
            entry_point_key: None,
            graph_layers: Vec::new(),
        }
    }
}

impl IndexSnapshot {
    /// Number of nodes in the bottom layer.
    pub fn node_count(&self) -> usize {
        self.graph_layers.first().map_or(0, HashMap::len)
    }
}

/// A complete importable dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub index: IndexSnapshot,
    pub keys: Vec<String>,
    pub embeddings: Vec<Vec<f32>>,
}

impl Dataset {
    /// Parse a dataset from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the dataset to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Number of keys carried by the dataset.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Check that keys and embeddings line up with each other and with the graph.
    pub fn validate(&self) -> Result<()> {
        self.clone().into_index().map(|_| ())
    }

    /// Build a searchable index from the dataset.
    ///
    /// The graph is loaded as-is and the embeddings are attached without
    /// recomputing any links.
    pub fn into_index(self) -> Result<Hnsw> {
        let mut index = Hnsw::from_snapshot(self.index)?;
        index.bulk_insert_skip_index(self.keys, self.embeddings)?;
        index.ensure_graph_vectors()?;
        Ok(index)
    }

    /// Capture an index, its keys and its vectors in insertion order.
    pub fn from_index(index: &Hnsw) -> Self {
        Self {
            index: index.export_index(),
            keys: index.keys().to_vec(),
            embeddings: index.vectors().to_vec(),
        }
    }
}
