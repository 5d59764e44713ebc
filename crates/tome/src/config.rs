//! Configuration file support for tome.
//!
//! tome keeps its data in a `.tome/` directory:
//! - `.tome/config.toml` - Configuration file
//! - `.tome/database.json` - Dataset built by `tome build`
//! - `.tome/embedder/` - Local embedding models
//! - `.tome/logs/` - Log files written by `tome serve --log-dir`
//!
//! Config discovery searches for `.tome/config.toml` starting from the current
//! directory and walking up to parent directories.

use std::path::{Path, PathBuf};

/// The tome data directory name.
pub const TOME_DIR: &str = ".tome";
/// The config file name within the tome directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Embedding providers understood by `[embedder] provider`.
pub const PROVIDERS: &[&str] = &["onnx", "ollama", "hash"];

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tome_index::{DistanceFunction, HnswConfig};
use tome_rag::{ModelDtype, OnnxConfig, RetrievalConfig};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Embedding model settings.
    pub embedder: EmbedderConfig,
    /// Index build and search settings.
    pub index: IndexConfig,
    /// Retrieval settings.
    pub retrieval: RetrievalSection,
    /// Where the dataset lives and where fetched documents go.
    pub database: DatabaseConfig,
    /// HTTP server settings.
    pub server: ServerSection,
}

/// Embedding model configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// Provider: "onnx", "ollama" or "hash".
    pub provider: String,
    /// Model id (provider-specific default when unset).
    pub model: Option<String>,
    /// Directory holding local models (relative to `.tome/`).
    pub model_root: PathBuf,
    /// ONNX weight precision.
    pub dtype: String,
    /// Ollama base URL override.
    pub base_url: Option<String>,
    /// Vector size for the hash embedder.
    pub dimension: usize,
    /// Texts per embedding call when building.
    pub batch_size: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider().to_string(),
            model: None,
            model_root: PathBuf::from("embedder"),
            dtype: "fp16".to_string(),
            base_url: None,
            dimension: 256,
            batch_size: 32,
        }
    }
}

fn default_provider() -> &'static str {
    if cfg!(feature = "onnx") { "onnx" } else { "hash" }
}

/// Index configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexConfig {
    /// "cosine" or "cosine-normalized".
    pub distance: String,
    /// Links per node above the bottom layer.
    pub m: usize,
    /// Candidate list size while building.
    pub ef_construction: usize,
    /// Candidate list size while searching (defaults to ef_construction).
    pub ef_search: Option<usize>,
    /// Seed for level generation.
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            distance: "cosine".to_string(),
            m: tome_index::DEFAULT_M,
            ef_construction: tome_index::DEFAULT_EF_CONSTRUCTION,
            ef_search: None,
            seed: 0,
        }
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalSection {
    /// Documents fetched when the caller does not say.
    pub top_k: usize,
    /// Instructions placed before the prompt by `query --converse`.
    pub context_prompt: String,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            top_k: tome_rag::DEFAULT_TOP_K,
            context_prompt: "Answer the prompt using the documents below.".to_string(),
        }
    }
}

/// Dataset locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Dataset JSON file (relative to `.tome/`).
    pub path: PathBuf,
    /// JSON-lines file receiving fetched documents (logged when unset).
    pub documents_out: Option<PathBuf>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("database.json"),
            documents_out: None,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: tome_rag::DEFAULT_PORT,
            cors: true,
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration from current or parent directories.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Returns the config and the `.tome` directory it was found in.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let tome_dir = dir.join(TOME_DIR);
            let config_path = tome_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, tome_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Resolve a configured path relative to the `.tome` directory.
    pub fn resolve_path(path: &Path, tome_dir: Option<&Path>) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else if let Some(dir) = tome_dir {
            dir.join(path)
        } else {
            PathBuf::from(TOME_DIR).join(path)
        }
    }

    pub fn database_path(&self, tome_dir: Option<&Path>) -> PathBuf {
        Self::resolve_path(&self.database.path, tome_dir)
    }

    pub fn documents_out(&self, tome_dir: Option<&Path>) -> Option<PathBuf> {
        self.database
            .documents_out
            .as_deref()
            .map(|p| Self::resolve_path(p, tome_dir))
    }

    /// Index parameters for building a dataset.
    pub fn hnsw_config(&self) -> Result<HnswConfig> {
        let distance: DistanceFunction = self
            .index
            .distance
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(HnswConfig::new()
            .with_distance(distance)
            .with_m(self.index.m)
            .with_ef_construction(self.index.ef_construction)
            .with_seed(self.index.seed))
    }

    pub fn retrieval_config(&self) -> RetrievalConfig {
        let config = RetrievalConfig::default().with_default_top_k(self.retrieval.top_k);
        match self.index.ef_search {
            Some(ef) => config.with_ef_search(ef),
            None => config,
        }
    }

    /// Local ONNX model settings.
    pub fn onnx_config(&self, tome_dir: Option<&Path>) -> Result<OnnxConfig> {
        let dtype: ModelDtype = self
            .embedder
            .dtype
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let mut config = OnnxConfig::new(Self::resolve_path(&self.embedder.model_root, tome_dir))
            .with_dtype(dtype)
            .with_batch_size(self.embedder.batch_size);
        if let Some(model) = &self.embedder.model {
            config = config.with_model_id(model);
        }
        Ok(config)
    }
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}

impl Config {
    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ConfigValidationError {
                field: field.to_string(),
                message,
            })
        };

        if !PROVIDERS.contains(&self.embedder.provider.as_str()) {
            push(
                "embedder.provider",
                format!(
                    "Invalid provider '{}'. Expected one of: {}.",
                    self.embedder.provider,
                    PROVIDERS.join(", ")
                ),
            );
        }

        if self.embedder.provider == "onnx" && !cfg!(feature = "onnx") {
            push(
                "embedder.provider",
                "tome was built without the `onnx` feature.".to_string(),
            );
        }

        if let Err(e) = self.embedder.dtype.parse::<ModelDtype>() {
            push("embedder.dtype", e);
        }

        if self.embedder.dimension == 0 {
            push(
                "embedder.dimension",
                "Dimension must be at least 1.".to_string(),
            );
        }

        if self.embedder.batch_size == 0 {
            push(
                "embedder.batch_size",
                "Batch size must be at least 1.".to_string(),
            );
        }

        if let Err(e) = self.index.distance.parse::<DistanceFunction>() {
            push("index.distance", e);
        }

        if self.index.m < 2 {
            push("index.m", "M must be at least 2.".to_string());
        }

        if self.index.ef_construction == 0 {
            push(
                "index.ef_construction",
                "ef_construction must be at least 1.".to_string(),
            );
        }

        if self.index.ef_search == Some(0) {
            push(
                "index.ef_search",
                "ef_search must be at least 1.".to_string(),
            );
        }

        if self.retrieval.top_k == 0 {
            push("retrieval.top_k", "top_k must be at least 1.".to_string());
        }

        errors
    }
}

/// Contents written by `tome init`.
pub const DEFAULT_CONFIG: &str = r#"# tome configuration
# All paths are relative to this .tome/ directory unless absolute

[embedder]
provider = "onnx"  # Options: "onnx" (needs the onnx feature), "ollama", "hash"
# model = "Xenova/nomic-embed-text-v1"  # Ollama default: "nomic-embed-text"
model_root = "embedder"  # Stored in .tome/embedder/<model>/
dtype = "fp16"  # Options: fp32, fp16, q8, int8, uint8, q4
# base_url = "http://localhost:11434"  # Ollama only
dimension = 256  # Hash embedder only
batch_size = 32

[index]
distance = "cosine"  # Options: "cosine", "cosine-normalized"
m = 16
ef_construction = 100
# ef_search = 100
seed = 0

[retrieval]
top_k = 5
context_prompt = "Answer the prompt using the documents below."

[database]
path = "database.json"  # Stored in .tome/database.json
# documents_out = "fetched.jsonl"

[server]
host = "127.0.0.1"
port = 8750
cors = true
"#;
