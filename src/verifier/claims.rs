//! Claim extraction: which sentences of a candidate answer make factual
//! statements, and which of those fall in a constrained domain.

use anyhow::Context;
use regex::{RegexSet, RegexSetBuilder};
use std::collections::HashSet;

use crate::config::VerifierConfig;

/// A sentence that asserts something checkable.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub text: String,
    /// Constrained domain the claim belongs to, if any.
    pub domain: Option<String>,
    /// Similarity a supporting passage must reach.
    pub threshold: f64,
}

impl Claim {
    pub fn is_constrained(&self) -> bool {
        self.domain.is_some()
    }
}

struct CompiledDomain {
    name: String,
    patterns: RegexSet,
    threshold: f64,
}

/// Splits candidate content into claims and tags constrained domains.
pub struct ClaimExtractor {
    domains: Vec<CompiledDomain>,
    default_threshold: f64,
}

impl ClaimExtractor {
    pub fn from_config(config: &VerifierConfig) -> anyhow::Result<Self> {
        let domains = config
            .domains
            .iter()
            .map(|d| {
                let patterns = RegexSetBuilder::new(&d.patterns)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("Invalid pattern in verifier domain '{}'", d.name))?;
                Ok(CompiledDomain {
                    name: d.name.clone(),
                    patterns,
                    threshold: d.similarity_threshold.unwrap_or(config.similarity_threshold),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            domains,
            default_threshold: config.similarity_threshold,
        })
    }

    pub fn domain_names(&self) -> Vec<&str> {
        self.domains.iter().map(|d| d.name.as_str()).collect()
    }

    /// Distinct claims in `content`, in order of first appearance.
    ///
    /// A sentence is a claim when it matches a constrained domain or states a
    /// figure (a digit or currency symbol). Other sentences are opinion or
    /// connective text and are not checked.
    pub fn extract(&self, content: &str) -> Vec<Claim> {
        let mut seen = HashSet::new();
        let mut claims = Vec::new();

        for sentence in sentences(content) {
            let key = sentence.to_lowercase();
            if !seen.insert(key) {
                continue;
            }
            let domain = self.domains.iter().find(|d| d.patterns.is_match(&sentence));
            let factual = domain.is_some() || states_figure(&sentence);
            if !factual {
                continue;
            }
            claims.push(Claim {
                domain: domain.map(|d| d.name.clone()),
                threshold: domain.map_or(self.default_threshold, |d| d.threshold),
                text: sentence,
            });
        }
        claims
    }
}

fn states_figure(sentence: &str) -> bool {
    sentence
        .chars()
        .any(|c| c.is_ascii_digit() || matches!(c, '$' | '€' | '£' | '¥' | '%'))
}

/// Split content into trimmed sentences with list markers and heading
/// markers removed. Terminators only split when followed by whitespace, so
/// "$2.5k" and "v1.2" stay whole.
pub(crate) fn sentences(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = strip_marker(line.trim());
        if line.is_empty() {
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let mut current = String::new();
        for (i, &c) in chars.iter().enumerate() {
            current.push(c);
            let boundary = matches!(c, '.' | '!' | '?')
                && chars.get(i + 1).map_or(true, |next| next.is_whitespace());
            if boundary {
                push_sentence(&mut out, &current);
                current.clear();
            }
        }
        push_sentence(&mut out, &current);
    }
    out
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let trimmed = raw
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace());
    if trimmed.chars().any(char::is_alphanumeric) {
        out.push(trimmed.to_string());
    }
}

fn strip_marker(line: &str) -> &str {
    let line = line.trim_start_matches('#').trim_start();
    for bullet in ["- ", "* ", "+ ", "> "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return rest.trim_start();
        }
    }
    // "1. " / "12) "
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim_start();
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ClaimExtractor {
        ClaimExtractor::from_config(&VerifierConfig::default()).unwrap()
    }

    #[test]
    fn sentences_strip_markers_and_keep_decimals() {
        let s = sentences("## Plan\n- Price at $2.5k per seat. Launch in Q3!\n2. Hire two reps");
        assert_eq!(s, vec!["Plan", "Price at $2.5k per seat", "Launch in Q3", "Hire two reps"]);
    }

    #[test]
    fn pricing_claim_is_constrained() {
        let claims = extractor().extract("The Enterprise tier is $10k. Customers love it.");
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].text, "The Enterprise tier is $10k");
        assert_eq!(claims[0].domain.as_deref(), Some("pricing"));
        assert!((claims[0].threshold - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn figures_outside_domains_are_unconstrained_claims() {
        let claims = extractor().extract("The market grew 40% last year.");
        assert_eq!(claims.len(), 1);
        assert!(!claims[0].is_constrained());
    }

    #[test]
    fn duplicate_sentences_collapse() {
        let claims = extractor().extract("Pro tier is $49.\n- pro tier is $49.");
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn per_domain_threshold_override() {
        let mut config = VerifierConfig::default();
        config.domains[1].similarity_threshold = Some(0.9);
        let extractor = ClaimExtractor::from_config(&config).unwrap();
        let claims = extractor.extract("Our tagline is Think Twice.");
        assert_eq!(claims[0].domain.as_deref(), Some("brand"));
        assert!((claims[0].threshold - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let mut config = VerifierConfig::default();
        config.domains[0].patterns.push("(".into());
        let err = ClaimExtractor::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("pricing"));
    }
}
