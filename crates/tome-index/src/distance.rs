//! Distance functions used by the graph.

use serde::{Deserialize, Serialize};

/// Built-in distance functions.
///
/// Serialized names match the `distanceFunctionType` field of exported
/// snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistanceFunction {
    /// `1 - cos(a, b)`.
    #[default]
    Cosine,
    /// `1 - a·b`, for vectors that are already unit length.
    CosineNormalized,
}

impl DistanceFunction {
    /// Compute the distance between two equal-length vectors.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceFunction::Cosine => cosine_distance(a, b),
            DistanceFunction::CosineNormalized => 1.0 - dot(a, b),
        }
    }

    /// Name used in snapshots and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            DistanceFunction::Cosine => "cosine",
            DistanceFunction::CosineNormalized => "cosine-normalized",
        }
    }
}

impl std::str::FromStr for DistanceFunction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DistanceFunction::Cosine),
            "cosine-normalized" => Ok(DistanceFunction::CosineNormalized),
            other => Err(format!(
                "Unknown distance function '{}'. Expected 'cosine' or 'cosine-normalized'.",
                other
            )),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine distance. Returns 1.0 when either vector has zero norm.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na.sqrt() * nb.sqrt())) as f32
}
