//! Startup loading of reference documents from a directory.

use anyhow::Context;
use std::path::Path;

use super::{Document, KnowledgeStore};

/// Extensions loaded as plain text.
const TEXT_EXTENSIONS: &[&str] = &["md", "txt"];

/// Load every supported file directly under `dir` into `store`, truncating
/// each to `max_chars`. Unreadable files are skipped with a warning.
/// Returns the number of documents ingested.
pub async fn load_dir(store: &dyn KnowledgeStore, dir: &Path, max_chars: usize) -> anyhow::Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read knowledge dir: {}", dir.display()))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let text = match read_document(&path).await {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable knowledge document");
                continue;
            }
        };
        if text.trim().is_empty() {
            continue;
        }
        let text = truncate(&text, max_chars);
        let revision = store.ingest(Document { id: id.clone(), text }).await?;
        tracing::info!(source_id = %id, revision, "Loaded knowledge document");
        loaded += 1;
    }
    Ok(loaded)
}

/// Read a file if its extension is supported; `Ok(None)` otherwise.
async fn read_document(path: &Path) -> anyhow::Result<Option<String>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return Ok(Some(tokio::fs::read_to_string(path).await?));
    }
    if ext == "pdf" {
        return read_pdf(path).await;
    }
    Ok(None)
}

#[cfg(feature = "rag-pdf")]
async fn read_pdf(path: &Path) -> anyhow::Result<Option<String>> {
    let path = path.to_path_buf();
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
        .await?
        .map_err(|e| anyhow::anyhow!("PDF extraction failed: {e}"))?;
    Ok(Some(text))
}

#[cfg(not(feature = "rag-pdf"))]
async fn read_pdf(path: &Path) -> anyhow::Result<Option<String>> {
    tracing::debug!(path = %path.display(), "PDF support not compiled in (enable rag-pdf)");
    Ok(None)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
