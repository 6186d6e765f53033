use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::directive::SourceLocator;

use super::{Document, KnowledgeStore, SearchHit};

// ── Tokenizing ───────────────────────────────────────────────────

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "have", "has", "had", "do",
    "does", "did", "will", "would", "could", "should", "it", "its", "of", "in", "to", "for",
    "on", "at", "by", "with", "from", "this", "that", "and", "or", "but", "our", "we", "you",
];

/// Passages with fewer tokens than this cannot claim to cover a claim by
/// themselves (a bare "Pricing" heading would otherwise match everything).
const MIN_PASSAGE_TOKENS: usize = 3;

/// Score multiplier when the claim names figures and none of them appear in
/// the passage.
const NUMERIC_MISMATCH_PENALTY: f64 = 0.5;

const MAX_HITS: usize = 5;

/// Lowercase, split on non-alphanumeric characters, and remove stop words.
pub(crate) fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty() && !STOP_WORDS.contains(token))
        .map(String::from)
        .collect()
}

fn is_numeric(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

/// Overlap score between a claim and a passage.
///
/// The larger of "how much of the claim the passage covers" and "how much of
/// the passage the claim restates", so a claim that paraphrases a long
/// passage and a passage that fully contains a short claim both score high.
fn overlap_score(claim: &HashSet<String>, passage: &HashSet<String>) -> f64 {
    if claim.is_empty() || passage.is_empty() {
        return 0.0;
    }
    let shared = claim.intersection(passage).count() as f64;
    let claim_coverage = shared / claim.len() as f64;
    let passage_coverage = if passage.len() >= MIN_PASSAGE_TOKENS {
        shared / passage.len() as f64
    } else {
        0.0
    };
    let mut score = claim_coverage.max(passage_coverage);

    let claim_numbers: Vec<&String> = claim.iter().filter(|t| is_numeric(t)).collect();
    if !claim_numbers.is_empty() && !claim_numbers.iter().any(|n| passage.contains(*n)) {
        score *= NUMERIC_MISMATCH_PENALTY;
    }
    score
}

// ── Passages ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Passage {
    locator: SourceLocator,
    tokens: HashSet<String>,
}

#[derive(Debug, Clone)]
struct IndexedDocument {
    revision: u32,
    passages: Vec<Passage>,
}

/// Split a document into scoreable passages: every non-empty line, plus every
/// multi-line paragraph. Form feeds (`\x0c`, as emitted by PDF extraction)
/// start a new page; line numbers restart on each page.
fn passages(text: &str) -> Vec<Passage> {
    let paginated = text.contains('\x0c');
    let mut out = Vec::new();

    for (page_idx, page) in text.split('\x0c').enumerate() {
        let page_no = paginated.then(|| u32::try_from(page_idx + 1).unwrap_or(u32::MAX));
        let mut paragraph: Vec<(u32, &str)> = Vec::new();

        for (line_idx, line) in page.lines().enumerate() {
            let line_no = u32::try_from(line_idx + 1).unwrap_or(u32::MAX);
            if line.trim().is_empty() {
                flush_paragraph(&mut paragraph, page_no, &mut out);
                continue;
            }
            let tokens = tokenize(line);
            if !tokens.is_empty() {
                out.push(Passage {
                    locator: SourceLocator {
                        page: page_no,
                        line_start: line_no,
                        line_end: line_no,
                    },
                    tokens,
                });
            }
            paragraph.push((line_no, line));
        }
        flush_paragraph(&mut paragraph, page_no, &mut out);
    }
    out
}

fn span(locator: &SourceLocator) -> u32 {
    locator.line_end.saturating_sub(locator.line_start)
}

fn flush_paragraph(paragraph: &mut Vec<(u32, &str)>, page: Option<u32>, out: &mut Vec<Passage>) {
    if paragraph.len() > 1 {
        let joined = paragraph.iter().map(|(_, l)| *l).collect::<Vec<_>>().join(" ");
        let (first, _) = paragraph[0];
        let (last, _) = paragraph[paragraph.len() - 1];
        out.push(Passage {
            locator: SourceLocator {
                page,
                line_start: first,
                line_end: last,
            },
            tokens: tokenize(&joined),
        });
    }
    paragraph.clear();
}

// ── Store ────────────────────────────────────────────────────────

/// In-memory lexical knowledge store.
///
/// Re-ingesting a document id replaces its passages and bumps its revision;
/// searches see either the old or the new revision, never a mix.
#[derive(Default)]
pub struct LexicalKnowledgeStore {
    documents: RwLock<HashMap<String, IndexedDocument>>,
}

impl LexicalKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingested document ids with their revisions, sorted by id.
    pub fn documents(&self) -> Vec<(String, u32)> {
        let mut docs: Vec<(String, u32)> = self
            .documents
            .read()
            .iter()
            .map(|(id, doc)| (id.clone(), doc.revision))
            .collect();
        docs.sort();
        docs
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    fn search_sync(&self, claim: &str) -> Vec<SearchHit> {
        let claim_tokens = tokenize(claim);
        if claim_tokens.is_empty() {
            return Vec::new();
        }

        let docs = self.documents.read();
        let mut hits: Vec<SearchHit> = Vec::new();
        for (id, doc) in docs.iter() {
            let best = doc
                .passages
                .iter()
                .map(|p| (overlap_score(&claim_tokens, &p.tokens), p))
                .filter(|(score, _)| *score > 0.0)
                // Ties go to the tightest, then earliest, passage.
                .max_by(|a, b| {
                    a.0.total_cmp(&b.0)
                        .then_with(|| span(&b.1.locator).cmp(&span(&a.1.locator)))
                        .then_with(|| b.1.locator.line_start.cmp(&a.1.locator.line_start))
                });
            if let Some((score, passage)) = best {
                hits.push(SearchHit {
                    source_id: id.clone(),
                    locator: passage.locator.clone(),
                    score,
                });
            }
        }
        drop(docs);

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.source_id.cmp(&b.source_id)));
        hits.truncate(MAX_HITS);
        hits
    }
}

#[async_trait]
impl KnowledgeStore for LexicalKnowledgeStore {
    async fn search(&self, claim: &str) -> anyhow::Result<Vec<SearchHit>> {
        Ok(self.search_sync(claim))
    }

    async fn ingest(&self, document: Document) -> anyhow::Result<u32> {
        if document.id.trim().is_empty() {
            anyhow::bail!("document id must not be empty");
        }
        // Index outside the lock; only the swap is guarded.
        let indexed = passages(&document.text);
        let mut docs = self.documents.write();
        let revision = docs.get(&document.id).map_or(1, |d| d.revision + 1);
        docs.insert(
            document.id.clone(),
            IndexedDocument {
                revision,
                passages: indexed,
            },
        );
        tracing::debug!(source_id = %document.id, revision, "Knowledge document indexed");
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRICING: &str = "Pricing\n\nStarter tier is $9 per seat per month.\nPro tier is $49 per seat per month.\n\nEnterprise tier is $25k per year.\nEnterprise includes SSO and audit logs.\n";

    async fn store_with_pricing() -> LexicalKnowledgeStore {
        let store = LexicalKnowledgeStore::new();
        store
            .ingest(Document {
                id: "pricing.pdf".into(),
                text: PRICING.into(),
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn tokenize_drops_stop_words_and_symbols() {
        let tokens = tokenize("The Enterprise tier is $25k.");
        assert!(tokens.contains("enterprise"));
        assert!(tokens.contains("25k"));
        assert!(!tokens.contains("the"));
        assert!(!tokens.contains("is"));
    }

    #[tokio::test]
    async fn exact_claim_scores_full_with_line_locator() {
        let store = store_with_pricing().await;
        let hits = store.search("Enterprise tier is $25k").await.unwrap();
        assert_eq!(hits[0].source_id, "pricing.pdf");
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert_eq!(hits[0].locator.line_start, 6);
        assert!(hits[0].locator.page.is_none());
    }

    #[tokio::test]
    async fn wrong_figure_falls_below_threshold() {
        let store = store_with_pricing().await;
        let hits = store.search("Enterprise tier is $10k").await.unwrap();
        assert!(hits.iter().all(|h| h.score < 0.75), "{hits:?}");
    }

    #[tokio::test]
    async fn unrelated_claim_has_no_hits() {
        let store = store_with_pricing().await;
        let hits = store.search("Quantum chromodynamics").await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn pages_are_tracked_across_form_feeds() {
        let store = LexicalKnowledgeStore::new();
        store
            .ingest(Document {
                id: "brand.pdf".into(),
                text: "Brand book\nVersion 3\x0cOur tagline is Think Twice.\n".into(),
            })
            .await
            .unwrap();
        let hits = store.search("The tagline is Think Twice").await.unwrap();
        assert_eq!(hits[0].locator.page, Some(2));
        assert_eq!(hits[0].locator.line_start, 1);
    }

    #[tokio::test]
    async fn reingest_bumps_revision_and_replaces_text() {
        let store = store_with_pricing().await;
        let rev = store
            .ingest(Document {
                id: "pricing.pdf".into(),
                text: "Enterprise tier is $30k per year.".into(),
            })
            .await
            .unwrap();
        assert_eq!(rev, 2);
        assert_eq!(store.documents(), vec![("pricing.pdf".to_string(), 2)]);

        let hits = store.search("Enterprise tier is $25k").await.unwrap();
        assert!(hits.iter().all(|h| h.score < 0.75));
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let store = LexicalKnowledgeStore::new();
        let result = store
            .ingest(Document {
                id: " ".into(),
                text: "x".into(),
            })
            .await;
        assert!(result.is_err());
    }
}
