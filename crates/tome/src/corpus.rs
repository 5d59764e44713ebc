//! Loading documents for `tome build`.
//!
//! A corpus is either a directory of `.txt`/`.md` files (the file stem is
//! the title) or a JSON array whose items are raw keys or
//! `{"title", "content"}` objects.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tome_rag::Document;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md"];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Entry {
    Key(String),
    Document {
        title: String,
        #[serde(default)]
        content: String,
    },
}

impl Entry {
    fn into_key(self) -> String {
        match self {
            Entry::Key(key) => key,
            Entry::Document { title, content } => Document::key(&title, content.trim_end()),
        }
    }
}

/// Read every document under `path` as an index key.
pub fn load_keys(path: &Path) -> Result<Vec<String>> {
    let keys = if path.is_dir() {
        load_directory(path)?
    } else {
        load_json(path)?
    };

    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(keys.len());
    for key in keys {
        if key.trim().is_empty() {
            continue;
        }
        if seen.insert(key.clone()) {
            unique.push(key);
        } else {
            tracing::warn!(title = %key.lines().next().unwrap_or_default(), "Skipping duplicate document");
        }
    }
    Ok(unique)
}

fn load_directory(dir: &Path) -> Result<Vec<String>> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| TEXT_EXTENSIONS.contains(&e))
        })
        .collect();
    files.sort();

    files
        .iter()
        .map(|file| {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let title = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            Ok(Document::key(title, content.trim()))
        })
        .collect()
}

fn load_json(file: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let entries: Vec<Entry> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", file.display()))?;
    Ok(entries.into_iter().map(Entry::into_key).collect())
}
