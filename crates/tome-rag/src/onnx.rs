//! Local ONNX embedding model.
//!
//! Models are read from a local directory laid out the way transformers.js
//! caches them:
//!
//! ```text
//! <model_root>/<model_id>/config.json
//! <model_root>/<model_id>/tokenizer.json
//! <model_root>/<model_id>/tokenizer_config.json
//! <model_root>/<model_id>/special_tokens_map.json
//! <model_root>/<model_id>/onnx/model_fp16.onnx
//! ```
//!
//! Nothing is ever downloaded. Inference requires the `onnx` feature.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Default embedding model.
pub const DEFAULT_MODEL_ID: &str = "Xenova/nomic-embed-text-v1";

/// Weight precision, selecting which ONNX export is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelDtype {
    Fp32,
    #[default]
    Fp16,
    Q8,
    Int8,
    Uint8,
    Q4,
}

impl ModelDtype {
    /// File name of the ONNX export for this precision.
    pub fn onnx_file_name(self) -> &'static str {
        match self {
            ModelDtype::Fp32 => "model.onnx",
            ModelDtype::Fp16 => "model_fp16.onnx",
            ModelDtype::Q8 => "model_quantized.onnx",
            ModelDtype::Int8 => "model_int8.onnx",
            ModelDtype::Uint8 => "model_uint8.onnx",
            ModelDtype::Q4 => "model_q4.onnx",
        }
    }
}

impl std::str::FromStr for ModelDtype {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fp32" => Ok(ModelDtype::Fp32),
            "fp16" => Ok(ModelDtype::Fp16),
            "q8" => Ok(ModelDtype::Q8),
            "int8" => Ok(ModelDtype::Int8),
            "uint8" => Ok(ModelDtype::Uint8),
            "q4" => Ok(ModelDtype::Q4),
            other => Err(format!(
                "Unknown dtype '{}'. Expected one of: fp32, fp16, q8, int8, uint8, q4.",
                other
            )),
        }
    }
}

/// Configuration for the local ONNX embedder.
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// Directory holding one sub-directory per model id.
    pub model_root: PathBuf,
    /// Model id, e.g. `Xenova/nomic-embed-text-v1`.
    pub model_id: String,
    /// Weight precision.
    pub dtype: ModelDtype,
    /// Inference batch size (None = library default).
    pub batch_size: Option<usize>,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            model_root: PathBuf::from("embedder"),
            model_id: DEFAULT_MODEL_ID.to_string(),
            dtype: ModelDtype::default(),
            batch_size: None,
        }
    }
}

impl OnnxConfig {
    pub fn new(model_root: impl Into<PathBuf>) -> Self {
        Self {
            model_root: model_root.into(),
            ..Default::default()
        }
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_dtype(mut self, dtype: ModelDtype) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Directory of the configured model.
    pub fn model_dir(&self) -> PathBuf {
        self.model_root.join(&self.model_id)
    }

    /// Resolve every file the model needs.
    pub fn paths(&self) -> ModelPaths {
        let dir = self.model_dir();
        ModelPaths {
            onnx: dir.join("onnx").join(self.dtype.onnx_file_name()),
            tokenizer: dir.join("tokenizer.json"),
            config: dir.join("config.json"),
            special_tokens_map: dir.join("special_tokens_map.json"),
            tokenizer_config: dir.join("tokenizer_config.json"),
        }
    }
}

/// Resolved model files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub onnx: PathBuf,
    pub tokenizer: PathBuf,
    pub config: PathBuf,
    pub special_tokens_map: PathBuf,
    pub tokenizer_config: PathBuf,
}

impl ModelPaths {
    fn all(&self) -> [&Path; 5] {
        [
            &self.onnx,
            &self.tokenizer,
            &self.config,
            &self.special_tokens_map,
            &self.tokenizer_config,
        ]
    }

    /// Files that do not exist on disk.
    pub fn missing(&self) -> Vec<PathBuf> {
        self.all()
            .into_iter()
            .filter(|p| !p.is_file())
            .map(Path::to_path_buf)
            .collect()
    }

    /// Fail with the list of missing files, if any.
    pub fn ensure_present(&self) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let list = missing
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(RagError::Embedding(format!(
            "Model files not found (remote models are disabled): {}",
            list
        )))
    }
}

#[cfg(feature = "onnx")]
pub use runtime::{OnnxEmbedder, lazy_onnx_embedder};

#[cfg(feature = "onnx")]
mod runtime {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use fastembed::{
        InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
    };

    use super::OnnxConfig;
    use crate::embedding::{Embedder, LazyEmbedder, SharedEmbedder, normalize_l2};
    use crate::error::{RagError, Result};

    /// Embedder running a local ONNX model with mean pooling.
    pub struct OnnxEmbedder {
        model: Arc<TextEmbedding>,
        config: OnnxConfig,
    }

    fn read(path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path)
            .map_err(|e| RagError::Embedding(format!("Failed to read {}: {}", path.display(), e)))
    }

    impl OnnxEmbedder {
        /// Load the model from disk. Blocking; call from `spawn_blocking`.
        pub fn load(config: OnnxConfig) -> Result<Self> {
            let paths = config.paths();
            paths.ensure_present()?;

            let tokenizer_files = TokenizerFiles {
                tokenizer_file: read(&paths.tokenizer)?,
                config_file: read(&paths.config)?,
                special_tokens_map_file: read(&paths.special_tokens_map)?,
                tokenizer_config_file: read(&paths.tokenizer_config)?,
            };
            let model = UserDefinedEmbeddingModel::new(read(&paths.onnx)?, tokenizer_files)
                .with_pooling(Pooling::Mean);

            let embedding =
                TextEmbedding::try_new_from_user_defined(model, InitOptionsUserDefined::default())
                    .map_err(|e| RagError::Embedding(format!("Failed to load model: {}", e)))?;

            tracing::info!(
                model = %config.model_id,
                dtype = ?config.dtype,
                path = %paths.onnx.display(),
                "Loaded ONNX embedding model"
            );

            Ok(Self {
                model: Arc::new(embedding),
                config,
            })
        }
    }

    /// An embedder that loads the model on its first call.
    pub fn lazy_onnx_embedder(config: OnnxConfig) -> LazyEmbedder {
        let name = config.model_id.clone();
        LazyEmbedder::new(name, move || {
            let config = config.clone();
            async move {
                let embedder = tokio::task::spawn_blocking(move || OnnxEmbedder::load(config))
                    .await
                    .map_err(|e| RagError::Internal(format!("Model load task failed: {}", e)))??;
                Ok(Arc::new(embedder) as SharedEmbedder)
            }
        })
    }

    #[async_trait]
    impl Embedder for OnnxEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let model = self.model.clone();
            let batch = texts.to_vec();
            let batch_size = self.config.batch_size;

            let mut vectors = tokio::task::spawn_blocking(move || model.embed(batch, batch_size))
                .await
                .map_err(|e| RagError::Internal(format!("Embedding task failed: {}", e)))?
                .map_err(|e| RagError::Embedding(e.to_string()))?;

            for vector in &mut vectors {
                normalize_l2(vector);
            }
            Ok(vectors)
        }

        fn name(&self) -> &str {
            &self.config.model_id
        }
    }
}
