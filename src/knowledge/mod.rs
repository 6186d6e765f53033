//! Knowledge store: the trusted reference documents deep-path claims are
//! checked against.
//!
//! The verifier only depends on [`KnowledgeStore`]; the bundled
//! [`LexicalKnowledgeStore`] scores token overlap, and any other backend
//! (embeddings, an external document-QA service) can sit behind the same
//! trait as long as it returns a score and a locator.

pub mod lexical;
pub mod loader;

pub use lexical::LexicalKnowledgeStore;
pub use loader::load_dir;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::directive::SourceLocator;

/// A reference document handed to [`KnowledgeStore::ingest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier, usually the file name (e.g. `pricing.pdf`).
    pub id: String,
    pub text: String,
}

/// One passage that may support a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub source_id: String,
    pub locator: SourceLocator,
    /// Normalized similarity in [0, 1].
    pub score: f64,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Passages supporting `claim`, best first.
    async fn search(&self, claim: &str) -> anyhow::Result<Vec<SearchHit>>;

    /// Add or replace a document. Returns the document's new revision.
    async fn ingest(&self, document: Document) -> anyhow::Result<u32>;
}
