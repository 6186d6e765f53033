//! Grounding verifier: gates deep-path output on citations from the
//! knowledge store.

pub mod claims;

pub use claims::{Claim, ClaimExtractor};

use std::sync::Arc;

use crate::config::VerifierConfig;
use crate::directive::{Citation, VerificationStatus};
use crate::error::EngineError;
use crate::knowledge::KnowledgeStore;

/// Label attached to factual claims outside constrained domains that no
/// source supports.
pub const UNVERIFIED_LABEL: &str = "unverified — no source";

/// A constrained-domain claim without sufficient support.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsupportedClaim {
    pub claim: String,
    pub domain: String,
    /// Best score found, 0.0 when nothing matched.
    pub best_score: f64,
    pub threshold: f64,
}

impl UnsupportedClaim {
    /// Reason string injected into the regeneration prompt.
    pub fn reason(&self) -> String {
        format!(
            "\"{}\" ({} claim; best source match {:.2}, need {:.2})",
            self.claim, self.domain, self.best_score, self.threshold
        )
    }
}

/// Verdict on one candidate answer.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    /// `Approved` or `Rejected`; the router decides `Regenerated`.
    pub status: VerificationStatus,
    pub citations: Vec<Citation>,
    pub unsupported: Vec<UnsupportedClaim>,
    /// Claims outside constrained domains with no supporting source.
    pub unverified: Vec<String>,
}

impl VerificationOutcome {
    pub fn is_approved(&self) -> bool {
        self.status == VerificationStatus::Approved
    }

    pub fn rejection_reasons(&self) -> Vec<String> {
        self.unsupported.iter().map(UnsupportedClaim::reason).collect()
    }

    /// Typed error describing the rejection, if any.
    pub fn to_error(&self) -> Option<EngineError> {
        if self.unsupported.is_empty() {
            return None;
        }
        Some(EngineError::VerificationUnsupported(
            self.unsupported.iter().map(|u| u.claim.clone()).collect(),
        ))
    }
}

pub struct GroundingVerifier {
    extractor: ClaimExtractor,
    store: Arc<dyn KnowledgeStore>,
}

impl GroundingVerifier {
    pub fn new(config: &VerifierConfig, store: Arc<dyn KnowledgeStore>) -> anyhow::Result<Self> {
        Ok(Self {
            extractor: ClaimExtractor::from_config(config)?,
            store,
        })
    }

    pub fn domain_names(&self) -> Vec<&str> {
        self.extractor.domain_names()
    }

    /// Check every claim in `content` against the knowledge store.
    ///
    /// A constrained claim is rejected only when the store has related
    /// passages and none reaches the threshold. When the store has nothing
    /// on the claim at all it is outside the store's coverage and is
    /// flagged unverified instead. The reasoning trace is not itself
    /// checked: only released content reaches the user.
    pub async fn verify(&self, content: &str, trace: Option<&str>) -> VerificationOutcome {
        let claims = self.extractor.extract(content);
        tracing::debug!(
            claims = claims.len(),
            trace_chars = trace.map_or(0, |t| t.chars().count()),
            "Verifying candidate"
        );

        let mut citations = Vec::new();
        let mut unsupported = Vec::new();
        let mut unverified = Vec::new();

        for claim in claims {
            // A failed search says nothing about coverage, so it still rejects.
            let (hits, uncovered) = match self.store.search(&claim.text).await {
                Ok(hits) => {
                    let uncovered = hits.is_empty();
                    (hits, uncovered)
                }
                Err(e) => {
                    tracing::warn!(error = %e, claim = %claim.text, "Knowledge search failed; claim treated as unsupported");
                    (Vec::new(), false)
                }
            };
            let best_score = hits.iter().map(|h| h.score).fold(0.0_f64, f64::max);
            let supporting = hits
                .into_iter()
                .filter(|h| h.score >= claim.threshold)
                .max_by(|a, b| a.score.total_cmp(&b.score));

            match (supporting, claim.domain) {
                (Some(hit), _) => citations.push(Citation {
                    claim: claim.text,
                    source_id: hit.source_id,
                    locator: hit.locator,
                    confidence: hit.score,
                }),
                (None, Some(domain)) if !uncovered => unsupported.push(UnsupportedClaim {
                    claim: claim.text,
                    domain,
                    best_score,
                    threshold: claim.threshold,
                }),
                (None, _) => unverified.push(claim.text),
            }
        }

        let status = if unsupported.is_empty() {
            VerificationStatus::Approved
        } else {
            VerificationStatus::Rejected
        };
        tracing::info!(
            status = status.as_str(),
            citations = citations.len(),
            unsupported = unsupported.len(),
            unverified = unverified.len(),
            "Verification verdict"
        );

        VerificationOutcome {
            status,
            citations,
            unsupported,
            unverified,
        }
    }
}

/// Append the unverified-claims annotation to `content`.
pub fn annotate_unverified(content: &str, unverified: &[String]) -> String {
    if unverified.is_empty() {
        return content.to_string();
    }
    let mut out = content.trim_end().to_string();
    out.push_str("\n\n---\n");
    for claim in unverified {
        out.push_str(&format!("- {claim} _({UNVERIFIED_LABEL})_\n"));
    }
    out
}
