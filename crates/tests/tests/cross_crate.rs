//! Cross-crate integration and E2E tests
//!
//! These tests verify that the crates work together correctly
//! and test full request flows through the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, routing::post};
use tome_index::{Dataset, HnswConfig};
use tome_rag::{
    BridgeServer, Document, Embedder, FileBridge, HashEmbedder, MemoryBridge, OllamaConfig,
    OllamaEmbedder, RetrievalConfig, RetrievalService, ServerConfig, SharedEmbedder,
    build_dataset,
};

const DIM: usize = 64;

/// Get an available port for testing.
fn get_test_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn documents() -> Vec<String> {
    vec![
        Document::key("Greeting", "hello hello and welcome"),
        Document::key("Weather", "rain is expected tomorrow afternoon"),
        Document::key("Recipe", "simmer the tomatoes with garlic"),
    ]
}

async fn dataset() -> Dataset {
    let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(DIM));
    build_dataset(documents(), &embedder, HnswConfig::default().with_seed(5), 2)
        .await
        .unwrap()
}

/// Start `server` in the background; returns its base URL and a shutdown handle.
async fn spawn_server(
    server: BridgeServer,
    port: u16,
) -> (
    String,
    tokio::sync::oneshot::Sender<()>,
    tokio::task::JoinHandle<std::io::Result<()>>,
) {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        server
            .run_with_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
    });

    // Wait for server to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    (format!("http://127.0.0.1:{}", port), shutdown_tx, handle)
}

/// E2E Test: import through a file bridge, then fetch documents over HTTP
///
/// 1. Dataset is built and written to disk
/// 2. Client triggers /import, the server reads the file through the bridge
/// 3. Client fetches documents; the bridge sink receives the same documents
#[tokio::test]
async fn test_e2e_import_and_fetch() {
    let temp = tempfile::tempdir().unwrap();
    let database = temp.path().join("database.json");
    let sink = temp.path().join("fetched.jsonl");
    std::fs::write(&database, dataset().await.to_json().unwrap()).unwrap();

    let service = RetrievalService::new(
        Arc::new(HashEmbedder::new(DIM)),
        Arc::new(FileBridge::new(Some(database)).with_documents_out(&sink)),
        RetrievalConfig::default(),
    );

    let port = get_test_port();
    let addr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = BridgeServer::new(ServerConfig::new(addr), Arc::new(service));
    let (base, shutdown_tx, handle) = spawn_server(server, port).await;

    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let import: serde_json::Value = client
        .post(format!("{}/import", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(import["status"], "imported");
    assert_eq!(import["nodes"], 3);

    let response = client
        .post(format!("{}/documents", base))
        .json(&serde_json::json!({"prompt": "hello", "top_k": 2}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();

    let prompt_text = body["prompt_text"].as_str().unwrap();
    assert!(prompt_text.starts_with("PROMPT:\nhello\n\nDOCUMENTS:\nGreeting:\nhello hello"));
    assert_eq!(body["documents"].as_array().unwrap().len(), 2);

    let written = std::fs::read_to_string(&sink).unwrap();
    let sent: Vec<Document> = serde_json::from_str(written.lines().next().unwrap()).unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].title, "Greeting");

    // Cleanup
    shutdown_tx.send(()).unwrap();
    let _ = handle.await;
}

/// E2E Test: malformed dataset is rejected and the served index is kept
#[tokio::test]
async fn test_e2e_rejected_import_keeps_index() {
    let bridge = Arc::new(MemoryBridge::with_database(
        dataset().await.to_json().unwrap(),
    ));
    let service = RetrievalService::new(
        Arc::new(HashEmbedder::new(DIM)),
        bridge.clone(),
        RetrievalConfig::default(),
    );

    let port = get_test_port();
    let addr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = BridgeServer::new(ServerConfig::new(addr), Arc::new(service));
    let (base, shutdown_tx, handle) = spawn_server(server, port).await;
    let client = reqwest::Client::new();

    client.post(format!("{}/import", base)).send().await.unwrap();

    let mut broken = dataset().await;
    broken.keys.push("Orphan\nno embedding".to_string());
    bridge.set_database(Some(broken.to_json().unwrap())).unwrap();

    let response = client
        .post(format!("{}/import", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Length mismatch")
    );

    let stats: serde_json::Value = client
        .get(format!("{}/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["nodes"], 3);

    shutdown_tx.send(()).unwrap();
    let _ = handle.await;
}

/// E2E Test: Ollama embedder against a stand-in `/api/embed` endpoint
///
/// The stand-in answers with hash embeddings, so a dataset built through
/// Ollama matches one built locally.
#[tokio::test]
async fn test_e2e_ollama_embedder_builds_dataset() {
    let port = get_test_port();
    let app = Router::new().route(
        "/api/embed",
        post(|Json(body): Json<serde_json::Value>| async move {
            let input: Vec<String> = body["input"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect();
            let embeddings = HashEmbedder::new(DIM).embed(&input).await.unwrap();
            Json(serde_json::json!({ "model": body["model"], "embeddings": embeddings }))
        }),
    );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap();
    let stub = tokio::spawn(async move { axum::serve(listener, app).await });

    let ollama: SharedEmbedder = Arc::new(
        OllamaEmbedder::new(
            OllamaConfig::new()
                .with_base_url(format!("http://127.0.0.1:{}", port))
                .with_max_retries(0),
        )
        .unwrap(),
    );

    let remote = build_dataset(documents(), &ollama, HnswConfig::default().with_seed(5), 2)
        .await
        .unwrap();
    assert_eq!(remote.len(), 3);

    let service = RetrievalService::new(
        ollama,
        Arc::new(MemoryBridge::new()),
        RetrievalConfig::default(),
    );
    service.import_dataset(remote).unwrap();

    let retrieval = service
        .fetch_documents("garlic tomatoes", Some(1))
        .await
        .unwrap();
    assert_eq!(retrieval.documents[0].title, "Recipe");

    stub.abort();
}
