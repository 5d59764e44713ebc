//! Retrieval service.
//!
//! `RetrievalService` owns the embedder, the bridge and the current index.
//! Queries read an `Arc` snapshot of the index; imports build a fresh index
//! and swap it in, so a query sees either the old index or the new one.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tome_index::{Dataset, Hnsw, HnswConfig, QueryResult};

use crate::bridge::SharedBridge;
use crate::document::{Document, documents_from_result, format_prompt, with_context};
use crate::embedding::SharedEmbedder;
use crate::error::{RagError, Result};
use crate::events::{EventHub, RetrievalEvent};

/// Number of documents fetched when the caller does not say.
pub const DEFAULT_TOP_K: usize = 5;

/// Tunables for the retrieval service.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Documents returned when no top-K is given.
    pub default_top_k: usize,
    /// Search breadth for queries (None = the index's construction value).
    pub ef_search: Option<usize>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
            ef_search: None,
        }
    }
}

impl RetrievalConfig {
    pub fn with_default_top_k(mut self, top_k: usize) -> Self {
        self.default_top_k = top_k;
        self
    }

    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = Some(ef);
        self
    }
}

/// Result of fetching documents for a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    /// Prompt followed by the retrieved documents.
    pub prompt_text: String,
    pub documents: Vec<Document>,
}

/// Result of an import request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ImportOutcome {
    /// The host had no dataset; the index is unchanged.
    Skipped,
    /// The index was replaced.
    Imported { nodes: usize, layers: usize },
}

/// Shape of the current index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub nodes: usize,
    pub layers: usize,
    pub dimension: Option<usize>,
}

/// Embeds prompts, searches the index and reports to the host.
pub struct RetrievalService {
    embedder: SharedEmbedder,
    bridge: SharedBridge,
    index: RwLock<Arc<Hnsw>>,
    config: RetrievalConfig,
    events: EventHub,
}

impl RetrievalService {
    /// Create a service with an empty index.
    pub fn new(embedder: SharedEmbedder, bridge: SharedBridge, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            bridge,
            index: RwLock::new(Arc::new(Hnsw::default())),
            config,
            events: EventHub::new(),
        }
    }

    /// Start from an existing index.
    pub fn with_index(self, index: Hnsw) -> Self {
        Self {
            index: RwLock::new(Arc::new(index)),
            ..self
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn embedder(&self) -> &SharedEmbedder {
        &self.embedder
    }

    /// The index as of now. Later imports do not affect the returned value.
    pub fn index(&self) -> Result<Arc<Hnsw>> {
        let guard = self
            .index
            .read()
            .map_err(|e| RagError::Internal(format!("Failed to acquire read lock: {}", e)))?;
        Ok(Arc::clone(&guard))
    }

    fn replace_index(&self, index: Hnsw) -> Result<()> {
        let mut guard = self
            .index
            .write()
            .map_err(|e| RagError::Internal(format!("Failed to acquire write lock: {}", e)))?;
        *guard = Arc::new(index);
        Ok(())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let index = self.index()?;
        Ok(IndexStats {
            nodes: index.len(),
            layers: index.layer_count(),
            dimension: index.dimension(),
        })
    }

    /// Observe fetches and imports.
    pub fn subscribe(&self) -> broadcast::Receiver<RetrievalEvent> {
        self.events.subscribe()
    }

    /// Find the keys nearest to `text`.
    ///
    /// An index without layers answers with an empty result and the
    /// embedder is not consulted.
    pub async fn query(&self, text: &str, top_k: Option<usize>) -> Result<QueryResult> {
        let index = self.index()?;
        if index.is_empty() {
            tracing::debug!("Index has no layers, skipping query");
            return Ok(QueryResult::default());
        }

        let k = top_k.unwrap_or(self.config.default_top_k);
        let vector = self.embedder.embed_one(text).await?;
        let result = index.query(&vector, k, self.config.ef_search)?;
        tracing::debug!(k, hits = result.len(), "Queried index");
        Ok(result)
    }

    /// Retrieve documents for `prompt` and tell the host about them.
    pub async fn fetch_documents(&self, prompt: &str, top_k: Option<usize>) -> Result<Retrieval> {
        let result = self.query(prompt, top_k).await?;
        let documents = documents_from_result(&result);

        let documents_json = serde_json::to_string(&documents)?;
        self.bridge.fetched_documents(&documents_json).await?;

        self.events.publish(RetrievalEvent::DocumentsFetched {
            prompt: prompt.to_string(),
            documents: documents.clone(),
        });

        tracing::info!(documents = documents.len(), "Fetched documents");
        Ok(Retrieval {
            prompt_text: format_prompt(prompt, &documents),
            documents,
        })
    }

    /// Load the host's dataset, replacing the current index.
    ///
    /// Only an absent or empty database is skipped; anything else, including
    /// whitespace, must parse as a dataset.
    pub async fn handle_import(&self) -> Result<ImportOutcome> {
        let database = self.bridge.get_database().await?;
        match database {
            Some(json) if !json.is_empty() => self.import_json(&json),
            _ => {
                tracing::info!("No database provided, import skipped");
                Ok(ImportOutcome::Skipped)
            }
        }
    }

    /// Parse and import a serialized dataset.
    pub fn import_json(&self, json: &str) -> Result<ImportOutcome> {
        let dataset = Dataset::from_json(json)?;
        self.import_dataset(dataset)
    }

    /// Import a dataset, replacing the current index.
    ///
    /// The dataset is fully validated first; on error the current index is
    /// left as it was.
    pub fn import_dataset(&self, dataset: Dataset) -> Result<ImportOutcome> {
        let index = dataset.into_index()?;
        let nodes = index.len();
        let layers = index.layer_count();
        self.replace_index(index)?;

        tracing::info!(nodes, layers, "Imported dataset");
        self.events
            .publish(RetrievalEvent::Imported { nodes, layers });
        Ok(ImportOutcome::Imported { nodes, layers })
    }

    /// Text the host forwards to its chat bot, or None for an empty message.
    pub async fn converse_with_context(
        &self,
        message: &str,
        top_k: Option<usize>,
        context_prompt: &str,
    ) -> Result<Option<String>> {
        if message.is_empty() {
            return Ok(None);
        }
        let retrieval = self.fetch_documents(message, top_k).await?;
        Ok(Some(with_context(context_prompt, &retrieval.prompt_text)))
    }
}

impl std::fmt::Debug for RetrievalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalService")
            .field("embedder", &self.embedder.name())
            .field("config", &self.config)
            .field("events", &self.events)
            .finish()
    }
}

/// Embed `keys` in batches and index them into a new dataset.
pub async fn build_dataset(
    keys: Vec<String>,
    embedder: &SharedEmbedder,
    config: HnswConfig,
    batch_size: usize,
) -> Result<Dataset> {
    if batch_size == 0 {
        return Err(RagError::InvalidRequest(
            "batch size must be at least 1".to_string(),
        ));
    }

    let mut index = Hnsw::new(config);
    for (batch_number, batch) in keys.chunks(batch_size).enumerate() {
        let vectors = embedder.embed(batch).await?;
        if vectors.len() != batch.len() {
            return Err(RagError::Embedding(format!(
                "{} returned {} embeddings for {} inputs",
                embedder.name(),
                vectors.len(),
                batch.len()
            )));
        }
        index.bulk_insert(batch.to_vec(), vectors)?;
        tracing::debug!(batch = batch_number, indexed = index.len(), "Indexed batch");
    }

    tracing::info!(
        documents = index.len(),
        layers = index.layer_count(),
        "Built dataset"
    );
    Ok(Dataset::from_index(&index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{FileBridge, MemoryBridge};
    use crate::embedding::HashEmbedder;
    use tome_index::IndexError;

    const DIM: usize = 32;

    fn corpus() -> Vec<String> {
        vec![
            "Rust\nOwnership and borrowing keep memory safe".to_string(),
            "Tokio\nAn async runtime for network services".to_string(),
            "Serde\nSerialization framework for Rust data".to_string(),
            "Axum\nWeb framework built on hyper and tower".to_string(),
            "HNSW\nApproximate nearest neighbor graph search".to_string(),
            "Cooking\nBraise the onions slowly in butter".to_string(),
        ]
    }

    async fn dataset_json(keys: Vec<String>) -> String {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(DIM));
        build_dataset(keys, &embedder, HnswConfig::default().with_seed(7), 4)
            .await
            .unwrap()
            .to_json()
            .unwrap()
    }

    fn service(
        embedder: Arc<HashEmbedder>,
        bridge: Arc<MemoryBridge>,
    ) -> RetrievalService {
        RetrievalService::new(embedder, bridge, RetrievalConfig::default())
    }

    #[tokio::test]
    async fn test_empty_index_skips_embedder() {
        let embedder = Arc::new(HashEmbedder::new(DIM));
        let service = service(embedder.clone(), Arc::new(MemoryBridge::new()));

        for (prompt, k) in [("hello", Some(1)), ("", Some(50)), ("anything", None)] {
            let result = service.query(prompt, k).await.unwrap();
            assert!(result.is_empty());
            assert!(result.distances.is_empty());
        }
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_query_bounded_and_sorted() {
        let embedder = Arc::new(HashEmbedder::new(DIM));
        let service = service(embedder.clone(), Arc::new(MemoryBridge::new()));
        service
            .import_json(&dataset_json(corpus()).await)
            .unwrap();

        for k in [1, 3, 5, 100] {
            let result = service.query("async network runtime", Some(k)).await.unwrap();
            assert!(result.len() <= k);
            assert!(result.len() <= corpus().len());
            assert!(result.distances.windows(2).all(|w| w[0] <= w[1]));
        }
        assert_eq!(embedder.call_count(), 4);
    }

    #[tokio::test]
    async fn test_default_top_k() {
        let mut keys = corpus();
        keys.extend((0..6).map(|i| format!("Extra {}\nfiller text {}", i, i)));
        let service = service(
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(MemoryBridge::new()),
        );
        service.import_json(&dataset_json(keys).await).unwrap();

        let result = service.query("filler", None).await.unwrap();
        assert_eq!(result.len(), DEFAULT_TOP_K);
    }

    #[tokio::test]
    async fn test_import_skipped_leaves_index() {
        let bridge = Arc::new(MemoryBridge::new());
        let service = service(Arc::new(HashEmbedder::new(DIM)), bridge.clone());

        assert_eq!(service.handle_import().await.unwrap(), ImportOutcome::Skipped);
        assert!(service.index().unwrap().is_empty());

        service.import_json(&dataset_json(corpus()).await).unwrap();
        let before = service.stats().unwrap();
        let answer = service.query("async runtime", Some(3)).await.unwrap();

        bridge.set_database(Some(String::new())).unwrap();
        assert_eq!(service.handle_import().await.unwrap(), ImportOutcome::Skipped);
        bridge.set_database(None).unwrap();
        assert_eq!(service.handle_import().await.unwrap(), ImportOutcome::Skipped);

        assert_eq!(service.stats().unwrap(), before);
        assert_eq!(service.query("async runtime", Some(3)).await.unwrap(), answer);
    }

    #[tokio::test]
    async fn test_whitespace_database_is_not_skipped() {
        let bridge = Arc::new(MemoryBridge::with_database("   "));
        let service = service(Arc::new(HashEmbedder::new(DIM)), bridge);

        let err = service.handle_import().await.unwrap_err();
        assert!(matches!(err, RagError::Index(IndexError::Serialization(_))));
        assert!(service.index().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_database_file_skips_import() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(FileBridge::new(Some(dir.path().join("database.json"))));
        let service = RetrievalService::new(
            Arc::new(HashEmbedder::new(DIM)),
            bridge,
            RetrievalConfig::default(),
        );

        assert_eq!(service.handle_import().await.unwrap(), ImportOutcome::Skipped);
        assert!(service.index().unwrap().is_empty());

        service.import_json(&dataset_json(corpus()).await).unwrap();
        let before = service.stats().unwrap();
        let answer = service.query("async runtime", Some(3)).await.unwrap();

        assert_eq!(service.handle_import().await.unwrap(), ImportOutcome::Skipped);
        assert_eq!(service.stats().unwrap(), before);
        assert_eq!(service.query("async runtime", Some(3)).await.unwrap(), answer);
    }

    #[tokio::test]
    async fn test_import_from_bridge() {
        let bridge = Arc::new(MemoryBridge::with_database(dataset_json(corpus()).await));
        let service = service(Arc::new(HashEmbedder::new(DIM)), bridge);
        let mut events = service.subscribe();

        let outcome = service.handle_import().await.unwrap();
        let ImportOutcome::Imported { nodes, layers } = outcome else {
            panic!("expected import, got {:?}", outcome);
        };
        assert_eq!(nodes, corpus().len());
        assert!(layers >= 1);

        let result = service.query("anything", Some(100)).await.unwrap();
        assert_eq!(result.len(), corpus().len());

        assert_eq!(
            events.recv().await.unwrap(),
            RetrievalEvent::Imported { nodes, layers }
        );
    }

    #[tokio::test]
    async fn test_import_replaces_previous_index() {
        let service = service(
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(MemoryBridge::new()),
        );
        service.import_json(&dataset_json(corpus()).await).unwrap();
        service
            .import_json(&dataset_json(corpus()[..2].to_vec()).await)
            .unwrap();
        assert_eq!(service.stats().unwrap().nodes, 2);
    }

    #[tokio::test]
    async fn test_malformed_import_keeps_state() {
        let service = service(
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(MemoryBridge::new()),
        );
        let good = dataset_json(corpus()).await;
        service.import_json(&good).unwrap();
        let before = service.stats().unwrap();

        let mut dataset = Dataset::from_json(&good).unwrap();
        dataset.embeddings.pop();
        let err = service.import_dataset(dataset).unwrap_err();
        assert!(matches!(
            err,
            RagError::Index(IndexError::LengthMismatch { .. })
        ));

        let mut dataset = Dataset::from_json(&good).unwrap();
        dataset.embeddings[1].truncate(3);
        let err = service.import_dataset(dataset).unwrap_err();
        assert!(matches!(
            err,
            RagError::Index(IndexError::DimensionMismatch { .. })
        ));

        let err = service.import_json("not json").unwrap_err();
        assert!(matches!(err, RagError::Index(IndexError::Serialization(_))));

        assert_eq!(service.stats().unwrap(), before);
    }

    #[tokio::test]
    async fn test_fetch_documents_end_to_end() {
        let keys = vec![
            "Greeting\nhello hello".to_string(),
            "Farewell\ngoodbye for now".to_string(),
        ];
        let bridge = Arc::new(MemoryBridge::with_database(dataset_json(keys).await));
        let service = service(Arc::new(HashEmbedder::new(DIM)), bridge.clone());
        service.handle_import().await.unwrap();
        let mut events = service.subscribe();

        let retrieval = service.fetch_documents("hello", Some(2)).await.unwrap();
        assert!(retrieval.prompt_text.starts_with("PROMPT:\nhello\n\nDOCUMENTS:\n"));
        assert_eq!(retrieval.documents.len(), 2);
        assert_eq!(retrieval.documents[0].title, "Greeting");

        let notifications = bridge.notifications().unwrap();
        assert_eq!(notifications.len(), 1);
        let sent: Vec<Document> = serde_json::from_str(&notifications[0]).unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent, retrieval.documents);

        match events.recv().await.unwrap() {
            RetrievalEvent::DocumentsFetched { prompt, documents } => {
                assert_eq!(prompt, "hello");
                assert_eq!(documents.len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_documents_on_empty_index() {
        let bridge = Arc::new(MemoryBridge::new());
        let service = service(Arc::new(HashEmbedder::new(DIM)), bridge.clone());

        let retrieval = service.fetch_documents("hi", None).await.unwrap();
        assert_eq!(retrieval.prompt_text, "PROMPT:\nhi\n\nDOCUMENTS:\n");
        assert!(retrieval.documents.is_empty());
        assert_eq!(bridge.notifications().unwrap(), vec!["[]"]);
    }

    #[tokio::test]
    async fn test_bridge_failure_propagates() {
        let bridge = Arc::new(MemoryBridge::new());
        bridge.fail_notifications("host closed").unwrap();
        let service = service(Arc::new(HashEmbedder::new(DIM)), bridge);

        let err = service.fetch_documents("hi", None).await.unwrap_err();
        assert!(matches!(err, RagError::Bridge(_)));
    }

    #[tokio::test]
    async fn test_converse_with_context() {
        let service = service(
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(MemoryBridge::new()),
        );
        service.import_json(&dataset_json(corpus()).await).unwrap();

        assert_eq!(
            service
                .converse_with_context("", Some(2), "Answer briefly.")
                .await
                .unwrap(),
            None
        );

        let text = service
            .converse_with_context("memory safety", Some(2), "Answer briefly.")
            .await
            .unwrap()
            .unwrap();
        assert!(text.starts_with("Answer briefly.\n\nPROMPT:\nmemory safety\n\nDOCUMENTS:\n"));
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch() {
        let service = RetrievalService::new(
            Arc::new(HashEmbedder::new(DIM * 2)),
            Arc::new(MemoryBridge::new()),
            RetrievalConfig::default(),
        );
        service.import_json(&dataset_json(corpus()).await).unwrap();
        let err = service.query("x", Some(1)).await.unwrap_err();
        assert!(matches!(
            err,
            RagError::Index(IndexError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_build_dataset_self_match() {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(DIM));
        let dataset = build_dataset(corpus(), &embedder, HnswConfig::default(), 2)
            .await
            .unwrap();
        assert_eq!(dataset.len(), corpus().len());

        let service = RetrievalService::new(
            embedder,
            Arc::new(MemoryBridge::new()),
            RetrievalConfig::default(),
        );
        service.import_dataset(dataset).unwrap();
        for key in corpus() {
            let result = service.query(&key, Some(1)).await.unwrap();
            assert_eq!(result.keys[0], key);
        }
    }

    #[tokio::test]
    async fn test_with_prebuilt_index() {
        let dataset = Dataset::from_json(&dataset_json(corpus()).await).unwrap();
        let service = service(
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(MemoryBridge::new()),
        )
        .with_index(dataset.into_index().unwrap());

        let stats = service.stats().unwrap();
        assert_eq!(stats.nodes, corpus().len());
        assert_eq!(stats.dimension, Some(DIM));
        assert_eq!(service.query("tokio", Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_build_dataset_rejects_zero_batch() {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(DIM));
        let err = build_dataset(corpus(), &embedder, HnswConfig::default(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_query_snapshot_survives_import() {
        let service = service(
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(MemoryBridge::new()),
        );
        service.import_json(&dataset_json(corpus()).await).unwrap();
        let snapshot = service.index().unwrap();

        service
            .import_json(&dataset_json(corpus()[..1].to_vec()).await)
            .unwrap();
        assert_eq!(snapshot.len(), corpus().len());
        assert_eq!(service.index().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_queries_and_imports() {
        let service = Arc::new(service(
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(MemoryBridge::new()),
        ));
        let small = dataset_json(corpus()[..2].to_vec()).await;
        let full = dataset_json(corpus()).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            let json = if i % 2 == 0 { small.clone() } else { full.clone() };
            handles.push(tokio::spawn(async move {
                service.import_json(&json).unwrap();
                let result = service.query("rust", Some(100)).await.unwrap();
                assert!(result.len() == 2 || result.len() == corpus().len());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
