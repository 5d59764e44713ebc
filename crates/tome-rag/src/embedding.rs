//! Embedder trait and implementations.
//!
//! This module defines the abstraction over text embedding models and
//! provides lazy initialization, logging and deterministic test embedders.
//! Model-backed implementations live in [`crate::ollama`] and, with the
//! `onnx` feature, `crate::onnx`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::{RagError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Shared Retry Logic
// ─────────────────────────────────────────────────────────────────────────────

/// Execute an async operation with exponential backoff retry.
///
/// Retries only on transient errors (network failures). Non-retryable errors
/// are returned immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    embedder_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) || attempt >= max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                tracing::warn!(
                    embedder = embedder_name,
                    attempt = attempt,
                    max_retries = max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Embedding request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

/// Only network errors are considered retryable.
pub fn is_retryable(error: &RagError) -> bool {
    matches!(error, RagError::Network(_))
}

// ─────────────────────────────────────────────────────────────────────────────
// Vector Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Scale a vector to unit length in place. Zero vectors are left unchanged.
pub fn normalize_l2(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Average token vectors into a single vector of `dim` components.
pub fn mean_pool(tokens: &[Vec<f32>], dim: usize) -> Vec<f32> {
    let mut pooled = vec![0.0; dim];
    if tokens.is_empty() {
        return pooled;
    }
    for token in tokens {
        for (p, x) in pooled.iter_mut().zip(token) {
            *p += x;
        }
    }
    let n = tokens.len() as f32;
    for p in &mut pooled {
        *p /= n;
    }
    pooled
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedder Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for text embedding models.
///
/// Implementations return one mean-pooled, L2-normalized vector per input
/// text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the name of this embedder.
    fn name(&self) -> &str;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| RagError::Embedding(format!("{} returned no vectors", self.name())))
    }
}

/// An embedder that can be shared across tasks.
pub type SharedEmbedder = Arc<dyn Embedder>;

// ─────────────────────────────────────────────────────────────────────────────
// Lazy Initialization
// ─────────────────────────────────────────────────────────────────────────────

type LoadFuture = Pin<Box<dyn Future<Output = Result<SharedEmbedder>> + Send>>;
type Loader = Box<dyn Fn() -> LoadFuture + Send + Sync>;

/// An embedder whose model is loaded on first use.
///
/// Concurrent first calls share one load. A failed load is not cached: the
/// next call tries again.
pub struct LazyEmbedder {
    name: String,
    loader: Loader,
    inner: OnceCell<SharedEmbedder>,
}

impl LazyEmbedder {
    /// Create a lazy embedder from an async loader.
    pub fn new<F, Fut>(name: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SharedEmbedder>> + Send + 'static,
    {
        Self {
            name: name.into(),
            loader: Box::new(move || Box::pin(loader())),
            inner: OnceCell::new(),
        }
    }

    /// Whether the model has finished loading.
    pub fn is_loaded(&self) -> bool {
        self.inner.initialized()
    }

    async fn get(&self) -> Result<&SharedEmbedder> {
        self.inner
            .get_or_try_init(|| async {
                tracing::info!(embedder = %self.name, "Loading embedding model");
                let start = std::time::Instant::now();
                let loaded = (self.loader)().await;
                match &loaded {
                    Ok(_) => tracing::info!(
                        embedder = %self.name,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Embedding model ready"
                    ),
                    Err(e) => tracing::warn!(
                        embedder = %self.name,
                        error = %e,
                        "Embedding model failed to load"
                    ),
                }
                loaded
            })
            .await
    }
}

impl std::fmt::Debug for LazyEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyEmbedder")
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[async_trait]
impl Embedder for LazyEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.get().await?.embed(texts).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Wrapper
// ─────────────────────────────────────────────────────────────────────────────

/// An embedder that wraps another embedder with request logging.
pub struct LoggingEmbedder<E: Embedder> {
    inner: E,
    name: String,
}

impl<E: Embedder> LoggingEmbedder<E> {
    pub fn new(inner: E) -> Self {
        let name = format!("logging({})", inner.name());
        Self { inner, name }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for LoggingEmbedder<E> {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = std::time::Instant::now();
        let result = self.inner.embed(texts).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(vectors) => tracing::debug!(
                embedder = self.inner.name(),
                texts = texts.len(),
                dimension = vectors.first().map_or(0, Vec::len),
                duration_ms = elapsed.as_millis() as u64,
                "Embedding successful"
            ),
            Err(e) => tracing::warn!(
                embedder = self.inner.name(),
                texts = texts.len(),
                error = %e,
                duration_ms = elapsed.as_millis() as u64,
                "Embedding failed"
            ),
        }

        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hashing Embedder
// ─────────────────────────────────────────────────────────────────────────────

/// A deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed to a signed unit vector; the
/// token vectors are mean pooled and normalized. Texts sharing words land
/// close together, which is enough for tests and offline use. Counts its
/// calls so tests can assert when the model was (not) invoked.
#[derive(Debug)]
pub struct HashEmbedder {
    dimension: usize,
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of `embed` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<Vec<f32>> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| {
                let hash = fnv1a(t.to_lowercase().as_bytes());
                let mut token = vec![0.0; self.dimension];
                let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
                token[(hash % self.dimension as u64) as usize] = sign;
                token
            })
            .collect();
        let mut pooled = mean_pool(&tokens, self.dimension);
        normalize_l2(&mut pooled);
        pooled
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn name(&self) -> &str {
        "hash"
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
