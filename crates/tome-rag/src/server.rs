//! HTTP front end for the retrieval service.
//!
//! Exposes the bridge operations to hosts that talk HTTP instead of linking
//! the library directly.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::RagError;
use crate::service::{ImportOutcome, IndexStats, Retrieval, RetrievalService};

/// Default port for the bridge server.
pub const DEFAULT_PORT: u16 = 8750;

/// Configuration for the bridge server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_addr: SocketAddr,
    /// Whether to enable CORS.
    pub enable_cors: bool,
    /// Whether to enable request tracing (HTTP layer).
    pub enable_tracing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_tracing(mut self, enable: bool) -> Self {
        self.enable_tracing = enable;
        self
    }
}

#[derive(Debug, Deserialize)]
struct DocumentsRequest {
    prompt: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ConverseRequest {
    message: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    context_prompt: String,
}

/// Serves a [`RetrievalService`] over HTTP.
pub struct BridgeServer {
    config: ServerConfig,
    service: Arc<RetrievalService>,
}

impl BridgeServer {
    pub fn new(config: ServerConfig, service: Arc<RetrievalService>) -> Self {
        Self { config, service }
    }

    pub fn service(&self) -> &Arc<RetrievalService> {
        &self.service
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(handle_health))
            .route("/stats", get(handle_stats))
            .route("/documents", post(handle_documents))
            .route("/converse", post(handle_converse))
            .route("/import", post(handle_import))
            .with_state(self.service.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the server.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "Starting bridge server");
        axum::serve(listener, self.router()).await
    }

    /// Run the server until `shutdown` resolves.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "Starting bridge server");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ServerError> {
    serde_json::from_str(body)
        .map_err(|e| ServerError(RagError::InvalidRequest(format!("Invalid JSON: {}", e))))
}

/// Handle GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tome-rag"
    }))
}

/// Handle GET /stats
async fn handle_stats(
    State(service): State<Arc<RetrievalService>>,
) -> Result<Json<IndexStats>, ServerError> {
    Ok(Json(service.stats()?))
}

/// Handle POST /documents
async fn handle_documents(
    State(service): State<Arc<RetrievalService>>,
    body: String,
) -> Result<Json<Retrieval>, ServerError> {
    let request: DocumentsRequest = parse_body(&body)?;
    let retrieval = service
        .fetch_documents(&request.prompt, request.top_k)
        .await?;
    Ok(Json(retrieval))
}

/// Handle POST /converse
async fn handle_converse(
    State(service): State<Arc<RetrievalService>>,
    body: String,
) -> Result<Json<serde_json::Value>, ServerError> {
    let request: ConverseRequest = parse_body(&body)?;
    let text = service
        .converse_with_context(&request.message, request.top_k, &request.context_prompt)
        .await?;
    Ok(Json(serde_json::json!({ "text": text })))
}

/// Handle POST /import
///
/// An empty body pulls the dataset from the bridge; otherwise the body is
/// the dataset itself.
async fn handle_import(
    State(service): State<Arc<RetrievalService>>,
    body: String,
) -> Result<Json<ImportOutcome>, ServerError> {
    let outcome = if body.trim().is_empty() {
        service.handle_import().await?
    } else {
        service.import_json(&body)?
    };
    Ok(Json(outcome))
}

/// Error type for server responses.
#[derive(Debug)]
pub struct ServerError(RagError);

impl From<RagError> for ServerError {
    fn from(err: RagError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type) = match &self.0 {
            RagError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            RagError::Serialization(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            RagError::Index(_) => (StatusCode::BAD_REQUEST, "index_error"),
            RagError::Bridge(_) => (StatusCode::BAD_GATEWAY, "bridge_error"),
            RagError::Network(_) => (StatusCode::BAD_GATEWAY, "network_error"),
            RagError::Embedding(_) => (StatusCode::INTERNAL_SERVER_ERROR, "embedding_error"),
            RagError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            RagError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        tracing::warn!(error = %self.0, status = status.as_u16(), "Request failed");

        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": self.0.to_string()
            }
        });

        (status, Json(body)).into_response()
    }
}
