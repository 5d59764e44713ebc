//! Retrieved documents and prompt assembly.

use serde::{Deserialize, Serialize};
use tome_index::QueryResult;

/// A document recovered from an index key.
///
/// Keys store the document title on their first line and the body on the
/// remaining lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub content: String,
    pub distance: f32,
}

impl Document {
    /// Split a key into title and content.
    pub fn from_key(key: &str, distance: f32) -> Self {
        let mut lines = key.split('\n');
        let title = lines.next().unwrap_or_default().to_string();
        let content = lines.collect::<Vec<_>>().join("\n");
        Self {
            title,
            content,
            distance,
        }
    }

    /// Compose the index key for a title and body.
    pub fn key(title: &str, content: &str) -> String {
        if content.is_empty() {
            title.to_string()
        } else {
            format!("{}\n{}", title, content)
        }
    }
}

/// Map every hit of a query into a document, preserving order.
pub fn documents_from_result(result: &QueryResult) -> Vec<Document> {
    result
        .iter()
        .map(|(key, distance)| Document::from_key(key, distance))
        .collect()
}

/// Build the prompt text handed back to the host.
pub fn format_prompt(prompt: &str, documents: &[Document]) -> String {
    let body = documents
        .iter()
        .map(|d| format!("{}:\n{}", d.title, d.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("PROMPT:\n{}\n\nDOCUMENTS:\n{}", prompt, body)
}

/// Prefix a retrieval prompt with the host's context instructions.
pub fn with_context(context_prompt: &str, prompt_text: &str) -> String {
    format!("{}\n\n{}", context_prompt, prompt_text)
}
