//! Host bridge.
//!
//! The bridge is how the service talks to whatever embeds it: it pulls the
//! serialized dataset from the host and tells the host which documents were
//! fetched for a prompt.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{RagError, Result};

/// Capabilities the host exposes to the service.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// The serialized dataset, if the host has one.
    async fn get_database(&self) -> Result<Option<String>>;

    /// Receive the JSON array of documents fetched for a prompt.
    async fn fetched_documents(&self, documents_json: &str) -> Result<()>;
}

/// A bridge shared between the service and its callers.
pub type SharedBridge = Arc<dyn Bridge>;

/// In-memory bridge.
///
/// Holds a settable database string and records every notification.
#[derive(Default)]
pub struct MemoryBridge {
    database: Mutex<Option<String>>,
    notifications: Mutex<Vec<String>>,
    fail_notifications: Mutex<Option<String>>,
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> RagError {
    RagError::Internal(format!("Bridge lock poisoned: {}", e))
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bridge that already holds a database string.
    pub fn with_database(database: impl Into<String>) -> Self {
        let bridge = Self::default();
        if let Ok(mut slot) = bridge.database.lock() {
            *slot = Some(database.into());
        }
        bridge
    }

    /// Replace (or clear) the database string.
    pub fn set_database(&self, database: Option<String>) -> Result<()> {
        *self.database.lock().map_err(poisoned)? = database;
        Ok(())
    }

    /// Make every following notification fail with `message`.
    pub fn fail_notifications(&self, message: impl Into<String>) -> Result<()> {
        *self.fail_notifications.lock().map_err(poisoned)? = Some(message.into());
        Ok(())
    }

    /// All notifications received so far, oldest first.
    pub fn notifications(&self) -> Result<Vec<String>> {
        Ok(self.notifications.lock().map_err(poisoned)?.clone())
    }
}

#[async_trait]
impl Bridge for MemoryBridge {
    async fn get_database(&self) -> Result<Option<String>> {
        Ok(self.database.lock().map_err(poisoned)?.clone())
    }

    async fn fetched_documents(&self, documents_json: &str) -> Result<()> {
        if let Some(message) = self.fail_notifications.lock().map_err(poisoned)?.clone() {
            return Err(RagError::Bridge(message));
        }
        self.notifications
            .lock()
            .map_err(poisoned)?
            .push(documents_json.to_string());
        Ok(())
    }
}

/// File-backed bridge.
///
/// Reads the dataset from a file on every import and appends notifications
/// to a JSON-lines sink. Without a sink, notifications are only logged.
#[derive(Debug, Clone, Default)]
pub struct FileBridge {
    database_path: Option<PathBuf>,
    documents_out: Option<PathBuf>,
}

impl FileBridge {
    pub fn new(database_path: Option<PathBuf>) -> Self {
        Self {
            database_path,
            documents_out: None,
        }
    }

    /// Append each notification as one line to `path`.
    pub fn with_documents_out(mut self, path: impl Into<PathBuf>) -> Self {
        self.documents_out = Some(path.into());
        self
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.database_path.as_deref()
    }

    pub fn documents_out(&self) -> Option<&Path> {
        self.documents_out.as_deref()
    }
}

#[async_trait]
impl Bridge for FileBridge {
    async fn get_database(&self) -> Result<Option<String>> {
        let Some(path) = &self.database_path else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), bytes = contents.len(), "Read database file");
                Ok(Some(contents))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(path = %path.display(), "Database file not found");
                Ok(None)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to read database file");
                Ok(None)
            }
        }
    }

    async fn fetched_documents(&self, documents_json: &str) -> Result<()> {
        let Some(path) = &self.documents_out else {
            tracing::info!(documents = %documents_json, "Fetched documents");
            return Ok(());
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| RagError::Bridge(format!("Failed to open {}: {}", path.display(), e)))?;

        let mut line = documents_json.replace('\n', " ");
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RagError::Bridge(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(())
    }
}
