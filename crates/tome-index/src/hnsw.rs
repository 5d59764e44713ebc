//! Hierarchical Navigable Small World graph.
//!
//! The graph keeps its layers in the same shape as [`IndexSnapshot`] so that
//! snapshots load and export without conversion. Vectors live next to the
//! graph, keyed by the same strings, and can be attached without touching any
//! links (see [`Hnsw::bulk_insert_skip_index`]).

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::distance::DistanceFunction;
use crate::error::{IndexError, Result};
use crate::snapshot::{GraphLayer, IndexSnapshot};

pub const DEFAULT_M: usize = 16;
pub const DEFAULT_EF_CONSTRUCTION: usize = 100;

/// Upper bound on generated node levels.
const MAX_LEVEL: usize = 16;

/// Construction parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct HnswConfig {
    /// Distance function used for every comparison.
    pub distance: DistanceFunction,
    /// Links kept per node on upper layers.
    pub m: usize,
    /// Candidate list size while inserting.
    pub ef_construction: usize,
    /// Links kept per node on the bottom layer.
    pub m_max0: usize,
    /// Level normalization factor.
    pub ml: f64,
    /// Level generator seed.
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            distance: DistanceFunction::Cosine,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            m_max0: DEFAULT_M * 2,
            ml: 1.0 / (DEFAULT_M as f64).ln(),
            seed: 0,
        }
    }
}

impl HnswConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_distance(mut self, distance: DistanceFunction) -> Self {
        self.distance = distance;
        self
    }

    /// Set `m`, deriving `m_max0` and `ml` from it.
    pub fn with_m(mut self, m: usize) -> Self {
        let m = m.max(2);
        self.m = m;
        self.m_max0 = m * 2;
        self.ml = 1.0 / (m as f64).ln();
        self
    }

    pub fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn from_snapshot(snapshot: &IndexSnapshot) -> Self {
        Self {
            distance: snapshot.distance_function_type,
            m: snapshot.m.max(1),
            ef_construction: snapshot.ef_construction.max(1),
            m_max0: snapshot.m_max0.max(1),
            ml: snapshot.ml,
            seed: seed_from_number(snapshot.seed),
        }
    }
}

/// Snapshot seeds are arbitrary JSON numbers; integral ones map directly.
fn seed_from_number(seed: f64) -> u64 {
    if seed.fract() == 0.0 && seed >= 0.0 && seed < u64::MAX as f64 {
        seed as u64
    } else {
        seed.to_bits()
    }
}

/// Result of a k-nearest-neighbor query, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub keys: Vec<String>,
    pub distances: Vec<f32>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over `(key, distance)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.keys
            .iter()
            .map(String::as_str)
            .zip(self.distances.iter().copied())
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    distance: f32,
    key: String,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An in-memory HNSW index over string keys.
#[derive(Debug, Clone)]
pub struct Hnsw {
    config: HnswConfig,
    entry_point: Option<String>,
    layers: Vec<GraphLayer>,
    keys: Vec<String>,
    vectors: Vec<Vec<f32>>,
    positions: HashMap<String, usize>,
    dimension: Option<usize>,
    rng: StdRng,
}

impl Default for Hnsw {
    fn default() -> Self {
        Self::new(HnswConfig::default())
    }
}

impl Hnsw {
    /// Create an empty index.
    pub fn new(config: HnswConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            entry_point: None,
            layers: Vec::new(),
            keys: Vec::new(),
            vectors: Vec::new(),
            positions: HashMap::new(),
            dimension: None,
            rng,
        }
    }

    /// Create an index holding the graph of `snapshot` and no vectors.
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Result<Self> {
        let mut index = Self::new(HnswConfig::from_snapshot(&snapshot));
        index.load_index(snapshot)?;
        Ok(index)
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// True when the graph has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Number of nodes linked into the bottom layer.
    pub fn graph_len(&self) -> usize {
        self.layers.first().map_or(0, HashMap::len)
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    /// Stored keys in insertion order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Stored vectors, aligned with [`Hnsw::keys`].
    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn vector(&self, key: &str) -> Option<&[f32]> {
        self.positions.get(key).map(|&i| self.vectors[i].as_slice())
    }

    /// Insert a vector and link it into the graph.
    pub fn insert(&mut self, key: impl Into<String>, vector: Vec<f32>) -> Result<()> {
        let key = key.into();
        if self.layers.first().is_some_and(|l| l.contains_key(&key)) {
            return Err(IndexError::DuplicateKey(key));
        }
        self.check_vector(&key, &vector)?;
        let query = vector.clone();
        self.store_vector(key.clone(), vector);

        let level = self.random_level();

        let Some(entry) = self.entry_point.clone() else {
            self.layers = (0..=level)
                .map(|_| GraphLayer::from([(key.clone(), HashMap::new())]))
                .collect();
            self.entry_point = Some(key);
            return Ok(());
        };

        let top = self.layers.len() - 1;
        let mut entry_points = vec![Candidate {
            distance: self.distance_to(&query, &entry)?,
            key: entry,
        }];

        for layer in (level + 1..=top).rev() {
            entry_points = self.search_layer(&query, entry_points, 1, layer)?;
        }

        for layer in (0..=level.min(top)).rev() {
            let candidates =
                self.search_layer(&query, entry_points, self.config.ef_construction, layer)?;
            let max_links = self.max_links(layer);
            let neighbors: Vec<Candidate> =
                candidates.iter().take(self.config.m).cloned().collect();

            let links = neighbors
                .iter()
                .map(|n| (n.key.clone(), n.distance))
                .collect();
            self.layers[layer].insert(key.clone(), links);

            for neighbor in &neighbors {
                self.link(layer, &neighbor.key, &key, neighbor.distance, max_links);
            }
            entry_points = candidates;
        }

        if level > top {
            for _ in top + 1..=level {
                self.layers
                    .push(GraphLayer::from([(key.clone(), HashMap::new())]));
            }
            self.entry_point = Some(key);
        }

        Ok(())
    }

    /// Insert many vectors, linking each one.
    pub fn bulk_insert(&mut self, keys: Vec<String>, vectors: Vec<Vec<f32>>) -> Result<()> {
        check_lengths(&keys, &vectors)?;
        for (key, vector) in keys.into_iter().zip(vectors) {
            self.insert(key, vector)?;
        }
        Ok(())
    }

    /// Attach vectors to keys without touching the graph.
    ///
    /// Used after [`Hnsw::load_index`] when the links are already known. All
    /// vectors are checked before any is stored; an existing key has its
    /// vector replaced.
    pub fn bulk_insert_skip_index(
        &mut self,
        keys: Vec<String>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<()> {
        check_lengths(&keys, &vectors)?;
        let expected = self
            .dimension
            .or_else(|| vectors.first().map(Vec::len));
        for (key, vector) in keys.iter().zip(&vectors) {
            if vector.is_empty() {
                return Err(IndexError::EmptyVector(key.clone()));
            }
            if let Some(expected) = expected {
                if vector.len() != expected {
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        got: vector.len(),
                    });
                }
            }
        }
        for (key, vector) in keys.into_iter().zip(vectors) {
            self.store_vector(key, vector);
        }
        tracing::debug!(
            vectors = self.keys.len(),
            dimension = ?self.dimension,
            "Attached vectors without indexing"
        );
        Ok(())
    }

    /// Replace the graph and parameters with those of `snapshot`.
    ///
    /// Stored vectors are kept.
    pub fn load_index(&mut self, snapshot: IndexSnapshot) -> Result<()> {
        match (&snapshot.entry_point_key, snapshot.graph_layers.last()) {
            (Some(entry), Some(top)) if !top.contains_key(entry) => {
                return Err(IndexError::UnknownEntryPoint(entry.clone()));
            }
            (Some(entry), None) => return Err(IndexError::UnknownEntryPoint(entry.clone())),
            (None, Some(_)) => return Err(IndexError::MissingEntryPoint),
            _ => {}
        }

        self.config = HnswConfig::from_snapshot(&snapshot);
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.entry_point = snapshot.entry_point_key;
        self.layers = snapshot.graph_layers;
        tracing::debug!(
            layers = self.layers.len(),
            nodes = self.graph_len(),
            "Loaded graph snapshot"
        );
        Ok(())
    }

    /// Export the graph and parameters.
    pub fn export_index(&self) -> IndexSnapshot {
        IndexSnapshot {
            distance_function_type: self.config.distance,
            m: self.config.m,
            ef_construction: self.config.ef_construction,
            m_max0: self.config.m_max0,
            ml: self.config.ml,
            seed: self.config.seed as f64,
            use_indexed_db: false,
            entry_point_key: self.entry_point.clone(),
            graph_layers: self.layers.clone(),
        }
    }

    /// Fail if any node or link in the graph lacks a stored vector.
    pub fn ensure_graph_vectors(&self) -> Result<()> {
        for layer in &self.layers {
            for (key, links) in layer {
                if !self.contains(key) {
                    return Err(IndexError::MissingEmbedding(key.clone()));
                }
                if let Some(missing) = links.keys().find(|k| !self.contains(k)) {
                    return Err(IndexError::MissingEmbedding(missing.clone()));
                }
            }
        }
        Ok(())
    }

    /// Find the `k` nearest stored keys to `vector`.
    ///
    /// `ef` defaults to the construction value and is never below `k`.
    pub fn query(&self, vector: &[f32], k: usize, ef: Option<usize>) -> Result<QueryResult> {
        let Some(entry) = &self.entry_point else {
            return Ok(QueryResult::default());
        };
        if k == 0 {
            return Ok(QueryResult::default());
        }
        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }

        let mut entry_points = vec![Candidate {
            distance: self.distance_to(vector, entry)?,
            key: entry.clone(),
        }];
        for layer in (1..self.layers.len()).rev() {
            entry_points = self.search_layer(vector, entry_points, 1, layer)?;
        }

        let ef = ef.unwrap_or(self.config.ef_construction).max(k);
        let mut found = self.search_layer(vector, entry_points, ef, 0)?;
        found.truncate(k);

        let (keys, distances) = found.into_iter().map(|c| (c.key, c.distance)).unzip();
        Ok(QueryResult { keys, distances })
    }

    fn check_vector(&self, key: &str, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(IndexError::EmptyVector(key.to_string()));
        }
        match self.dimension {
            Some(expected) if expected != vector.len() => Err(IndexError::DimensionMismatch {
                expected,
                got: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    fn store_vector(&mut self, key: String, vector: Vec<f32>) {
        self.dimension.get_or_insert(vector.len());
        match self.positions.get(&key) {
            Some(&i) => self.vectors[i] = vector,
            None => {
                self.positions.insert(key.clone(), self.keys.len());
                self.keys.push(key);
                self.vectors.push(vector);
            }
        }
    }

    fn distance_to(&self, query: &[f32], key: &str) -> Result<f32> {
        self.vector(key)
            .map(|v| self.config.distance.distance(query, v))
            .ok_or_else(|| IndexError::MissingEmbedding(key.to_string()))
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m_max0
        } else {
            self.config.m
        }
    }

    fn random_level(&mut self) -> usize {
        let uniform: f64 = self.rng.random();
        let level = (-(1.0 - uniform).ln() * self.config.ml).floor();
        (level as usize).min(MAX_LEVEL)
    }

    /// Add `to` to the links of `from`, keeping only the nearest `max_links`.
    fn link(&mut self, layer: usize, from: &str, to: &str, distance: f32, max_links: usize) {
        let Some(links) = self.layers[layer].get_mut(from) else {
            return;
        };
        links.insert(to.to_string(), distance);
        if links.len() > max_links {
            let mut ordered: Vec<(String, f32)> = links.drain().collect();
            ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            ordered.truncate(max_links);
            links.extend(ordered);
        }
    }

    /// Best-first search of one layer. Returns up to `ef` candidates, nearest first.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: Vec<Candidate>,
        ef: usize,
        layer: usize,
    ) -> Result<Vec<Candidate>> {
        let ef = ef.max(1);
        let graph = &self.layers[layer];

        let mut visited: HashSet<String> = entry_points.iter().map(|c| c.key.clone()).collect();
        let mut frontier: BinaryHeap<Reverse<Candidate>> =
            entry_points.iter().cloned().map(Reverse).collect();
        let mut found: BinaryHeap<Candidate> = entry_points.into_iter().collect();
        while found.len() > ef {
            found.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            let furthest = found.peek().map_or(f32::INFINITY, |c| c.distance);
            if current.distance > furthest && found.len() >= ef {
                break;
            }
            let Some(links) = graph.get(&current.key) else {
                continue;
            };
            for neighbor in links.keys() {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let distance = self.distance_to(query, neighbor)?;
                let furthest = found.peek().map_or(f32::INFINITY, |c| c.distance);
                if found.len() < ef || distance < furthest {
                    let candidate = Candidate {
                        distance,
                        key: neighbor.clone(),
                    };
                    frontier.push(Reverse(candidate.clone()));
                    found.push(candidate);
                    if found.len() > ef {
                        found.pop();
                    }
                }
            }
        }

        Ok(found.into_sorted_vec())
    }
}

fn check_lengths(keys: &[String], vectors: &[Vec<f32>]) -> Result<()> {
    if keys.len() != vectors.len() {
        return Err(IndexError::LengthMismatch {
            keys: keys.len(),
            embeddings: vectors.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(angle_deg: f32) -> Vec<f32> {
        let r = angle_deg.to_radians();
        vec![r.cos(), r.sin()]
    }

    fn fan(n: usize) -> Hnsw {
        let mut index = Hnsw::new(HnswConfig::default().with_m(4).with_seed(42));
        for i in 0..n {
            index
                .insert(format!("node-{}", i), unit(i as f32 * 90.0 / n as f32))
                .unwrap();
        }
        index
    }

    #[test]
    fn test_query_empty_index() {
        let index = Hnsw::default();
        assert!(index.is_empty());
        let result = index.query(&[1.0, 0.0], 5, None).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_insert_single() {
        let mut index = Hnsw::default();
        index.insert("only", vec![1.0, 0.0]).unwrap();
        assert!(!index.is_empty());
        assert_eq!(index.len(), 1);
        assert_eq!(index.entry_point(), Some("only"));

        let result = index.query(&[0.0, 1.0], 5, None).unwrap();
        assert_eq!(result.keys, vec!["only"]);
    }

    #[test]
    fn test_query_finds_self_first() {
        let index = fan(40);
        for i in [0, 13, 39] {
            let key = format!("node-{}", i);
            let result = index.query(index.vector(&key).unwrap(), 3, None).unwrap();
            assert_eq!(result.keys[0], key);
            assert!(result.distances[0].abs() < 1e-5);
        }
    }

    #[test]
    fn test_query_sorted_and_bounded() {
        let index = fan(30);
        for k in [1, 5, 30, 100] {
            let result = index.query(&unit(33.0), k, None).unwrap();
            assert!(result.len() <= k);
            assert_eq!(result.len(), k.min(30));
            assert!(result.distances.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_query_zero_k() {
        let index = fan(5);
        assert!(index.query(&unit(10.0), 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_key() {
        let mut index = Hnsw::default();
        index.insert("a", vec![1.0, 0.0]).unwrap();
        let err = index.insert("a", vec![0.0, 1.0]).unwrap_err();
        assert!(matches!(err, IndexError::DuplicateKey(k) if k == "a"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = Hnsw::default();
        index.insert("a", vec![1.0, 0.0]).unwrap();
        assert!(matches!(
            index.insert("b", vec![1.0, 0.0, 0.0]),
            Err(IndexError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        ));
        assert!(matches!(
            index.query(&[1.0], 1, None),
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_vector_rejected() {
        let mut index = Hnsw::default();
        assert!(matches!(
            index.insert("a", vec![]),
            Err(IndexError::EmptyVector(_))
        ));
    }

    #[test]
    fn test_skip_index_checks_before_storing() {
        let mut index = Hnsw::default();
        let err = index
            .bulk_insert_skip_index(
                vec!["a".to_string(), "b".to_string()],
                vec![vec![1.0, 0.0], vec![1.0]],
            )
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
        assert_eq!(index.len(), 0);

        let err = index
            .bulk_insert_skip_index(vec!["a".to_string()], vec![])
            .unwrap_err();
        assert!(matches!(err, IndexError::LengthMismatch { .. }));
    }

    #[test]
    fn test_skip_index_leaves_graph_untouched() {
        let mut index = Hnsw::default();
        index
            .bulk_insert_skip_index(vec!["a".to_string()], vec![vec![1.0, 0.0]])
            .unwrap();
        assert!(index.is_empty());
        assert_eq!(index.len(), 1);
        assert!(index.query(&[1.0, 0.0], 1, None).unwrap().is_empty());
    }

    #[test]
    fn test_export_load_round_trip() {
        let index = fan(25);
        let snapshot = index.export_index();
        assert_eq!(snapshot.node_count(), 25);

        let mut restored = Hnsw::from_snapshot(snapshot).unwrap();
        restored
            .bulk_insert_skip_index(index.keys().to_vec(), index.vectors().to_vec())
            .unwrap();
        restored.ensure_graph_vectors().unwrap();

        let q = unit(47.0);
        assert_eq!(
            restored.query(&q, 4, None).unwrap(),
            index.query(&q, 4, None).unwrap()
        );
    }

    #[test]
    fn test_load_rejects_unknown_entry_point() {
        let mut snapshot = fan(3).export_index();
        snapshot.entry_point_key = Some("missing".to_string());
        assert!(matches!(
            Hnsw::from_snapshot(snapshot),
            Err(IndexError::UnknownEntryPoint(_))
        ));
    }

    #[test]
    fn test_load_rejects_layers_without_entry_point() {
        let mut snapshot = fan(3).export_index();
        snapshot.entry_point_key = None;
        assert!(matches!(
            Hnsw::from_snapshot(snapshot),
            Err(IndexError::MissingEntryPoint)
        ));
    }

    #[test]
    fn test_links_are_bounded() {
        let index = fan(60);
        let snapshot = index.export_index();
        for (layer, graph) in snapshot.graph_layers.iter().enumerate() {
            let max = if layer == 0 { snapshot.m_max0 } else { snapshot.m };
            assert!(graph.values().all(|links| links.len() <= max));
        }
        assert!(snapshot.graph_layers[0].len() == 60);
    }

    #[test]
    fn test_seed_from_number() {
        assert_eq!(seed_from_number(42.0), 42);
        assert_eq!(seed_from_number(0.25), 0.25f64.to_bits());
        assert_eq!(seed_from_number(-1.0), (-1.0f64).to_bits());
    }

    #[test]
    fn test_query_result_iter() {
        let result = QueryResult {
            keys: vec!["a".to_string(), "b".to_string()],
            distances: vec![0.1, 0.2],
        };
        let pairs: Vec<_> = result.iter().collect();
        assert_eq!(pairs, vec![("a", 0.1), ("b", 0.2)]);
    }
}
