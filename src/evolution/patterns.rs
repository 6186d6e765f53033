//! Correction pattern catalogue and the miner that picks the single most
//! frequent pattern among rejected outcomes.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

use crate::config::CorrectionPatternConfig;
use crate::directive::ExecutionPath;
use crate::outcome::OutcomeRecord;

/// Pattern credited with rejected fast-path answers that match nothing else.
const FAST_PATH_FALLBACK: &str = "shallow_reasoning";

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionPattern {
    pub id: String,
    pub keywords: Vec<String>,
    pub amendment: String,
    pub threshold_delta: Option<f64>,
}

impl From<&CorrectionPatternConfig> for CorrectionPattern {
    fn from(c: &CorrectionPatternConfig) -> Self {
        Self {
            id: c.id.clone(),
            keywords: c.keywords.clone(),
            amendment: c.amendment.clone(),
            threshold_delta: c.threshold_delta,
        }
    }
}

fn pattern(id: &str, keywords: &[&str], amendment: &str, threshold_delta: Option<f64>) -> CorrectionPattern {
    CorrectionPattern {
        id: id.to_string(),
        keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
        amendment: amendment.to_string(),
        threshold_delta,
    }
}

/// Built-in catalogue. Order breaks frequency ties.
pub fn builtin_patterns() -> Vec<CorrectionPattern> {
    vec![
        pattern(
            "factual_inaccuracy",
            &["wrong", "incorrect", "inaccurate", "not true", "false", "outdated", "made up"],
            "Check every figure and factual statement against the reference documents; when a fact is not there, say it is unavailable.",
            None,
        ),
        pattern(
            "pricing_mismatch",
            &["price", "pricing", "tier", "discount", "cost", "quote"],
            "Quote prices, tiers and discounts exactly as written in the pricing documents and name the source.",
            None,
        ),
        pattern(
            "brand_violation",
            &["brand", "off-brand", "tone", "logo", "tagline", "voice"],
            "Follow the brand guidelines for product names, taglines and tone of voice.",
            None,
        ),
        pattern(
            "response_too_verbose",
            &["too long", "verbose", "wordy", "shorter", "concise", "tl;dr"],
            "Keep answers concise: lead with the answer and leave out background the user did not ask for.",
            None,
        ),
        pattern(
            "code_generation_issues",
            &["code", "function", "compile", "syntax", "bug"],
            "When writing code, give complete runnable snippets and state assumptions about the environment.",
            None,
        ),
        pattern(
            FAST_PATH_FALLBACK,
            &["shallow", "superficial", "more detail", "too simple", "think harder", "missing steps"],
            "Treat ambiguous requests as strategic: reason through options and trade-offs before answering.",
            Some(0.05),
        ),
    ]
}

/// Compiled catalogue.
pub struct PatternCatalogue {
    patterns: Vec<CorrectionPattern>,
    matcher: AhoCorasick,
    /// Keyword index -> pattern index.
    owners: Vec<usize>,
}

/// Winning pattern of a mining pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternFinding {
    pub pattern: CorrectionPattern,
    /// Rejected records attributed to the pattern.
    pub occurrences: usize,
}

impl PatternCatalogue {
    /// Built-ins followed by `extra`. An extra pattern with a built-in id
    /// replaces the built-in in place.
    pub fn new(extra: &[CorrectionPatternConfig]) -> anyhow::Result<Self> {
        let mut patterns = builtin_patterns();
        for c in extra {
            let p = CorrectionPattern::from(c);
            match patterns.iter_mut().find(|existing| existing.id == p.id) {
                Some(existing) => *existing = p,
                None => patterns.push(p),
            }
        }

        let mut keywords = Vec::new();
        let mut owners = Vec::new();
        for (idx, p) in patterns.iter().enumerate() {
            for k in &p.keywords {
                let k = k.trim();
                if !k.is_empty() {
                    keywords.push(k.to_string());
                    owners.push(idx);
                }
            }
        }
        let matcher = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::Standard)
            .build(&keywords)?;

        Ok(Self {
            patterns,
            matcher,
            owners,
        })
    }

    pub fn patterns(&self) -> &[CorrectionPattern] {
        &self.patterns
    }

    /// Pattern indices a record is attributed to: keyword hits in the edit
    /// note and directive text, whole words only.
    fn attribute(&self, record: &OutcomeRecord) -> Vec<usize> {
        let text = format!(
            "{} {}",
            record.edit_note.as_deref().unwrap_or_default(),
            record.directive_text
        );
        let bytes = text.as_bytes();
        let mut hits: Vec<usize> = self
            .matcher
            .find_overlapping_iter(&text)
            .filter(|m| {
                let before = m.start().checked_sub(1).map(|i| bytes[i]);
                let after = bytes.get(m.end()).copied();
                !before.is_some_and(|b| b.is_ascii_alphanumeric())
                    && !after.is_some_and(|b| b.is_ascii_alphanumeric())
            })
            .map(|m| self.owners[m.pattern().as_usize()])
            .collect();
        hits.sort_unstable();
        hits.dedup();

        if hits.is_empty() && record.path == ExecutionPath::Fast {
            if let Some(idx) = self.patterns.iter().position(|p| p.id == FAST_PATH_FALLBACK) {
                hits.push(idx);
            }
        }
        hits
    }

    /// Most frequent pattern across `rejected`; each record counts at most
    /// once per pattern. Ties go to catalogue order.
    pub fn most_frequent<'a>(&self, rejected: impl IntoIterator<Item = &'a OutcomeRecord>) -> Option<PatternFinding> {
        let mut counts = vec![0usize; self.patterns.len()];
        for record in rejected {
            for idx in self.attribute(record) {
                counts[idx] += 1;
            }
        }
        let (best, &occurrences) = counts
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(&a.0)))?;
        (occurrences > 0).then(|| PatternFinding {
            pattern: self.patterns[best].clone(),
            occurrences,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Disposition;
    use crate::test_support::outcome_record;
    use chrono::Utc;

    fn rejected(note: &str, path: ExecutionPath) -> OutcomeRecord {
        let mut r = outcome_record("draft a plan", Utc::now());
        r.disposition = Disposition::Rejected;
        r.edit_note = Some(note.into());
        r.path = path;
        r
    }

    #[test]
    fn most_frequent_pattern_wins() {
        let catalogue = PatternCatalogue::new(&[]).unwrap();
        let records = vec![
            rejected("way too long", ExecutionPath::Deep),
            rejected("Verbose, cut it down", ExecutionPath::Deep),
            rejected("the price is wrong", ExecutionPath::Deep),
        ];
        let finding = catalogue.most_frequent(&records).unwrap();
        assert_eq!(finding.pattern.id, "response_too_verbose");
        assert_eq!(finding.occurrences, 2);
    }

    #[test]
    fn ties_follow_catalogue_order() {
        let catalogue = PatternCatalogue::new(&[]).unwrap();
        let records = vec![
            rejected("too verbose", ExecutionPath::Deep),
            rejected("incorrect", ExecutionPath::Deep),
        ];
        assert_eq!(catalogue.most_frequent(&records).unwrap().pattern.id, "factual_inaccuracy");
    }

    #[test]
    fn keywords_match_whole_words() {
        let catalogue = PatternCatalogue::new(&[]).unwrap();
        // "encode" must not count as "code", "frontier" not as "tier".
        let records = vec![rejected("encode the frontier differently", ExecutionPath::Deep)];
        assert!(catalogue.most_frequent(&records).is_none());
    }

    #[test]
    fn unmatched_fast_rejections_count_as_shallow() {
        let catalogue = PatternCatalogue::new(&[]).unwrap();
        let records = vec![
            rejected("no", ExecutionPath::Fast),
            rejected("nope", ExecutionPath::Fast),
        ];
        let finding = catalogue.most_frequent(&records).unwrap();
        assert_eq!(finding.pattern.id, "shallow_reasoning");
        assert_eq!(finding.pattern.threshold_delta, Some(0.05));
    }

    #[test]
    fn config_patterns_extend_and_override() {
        let extra = vec![
            CorrectionPatternConfig {
                id: "legal_terms".into(),
                keywords: vec!["contract".into()],
                amendment: "Quote contract terms verbatim.".into(),
                threshold_delta: None,
            },
            CorrectionPatternConfig {
                id: "response_too_verbose".into(),
                keywords: vec!["rambling".into()],
                amendment: "Be brief.".into(),
                threshold_delta: None,
            },
        ];
        let catalogue = PatternCatalogue::new(&extra).unwrap();
        assert_eq!(catalogue.patterns().len(), builtin_patterns().len() + 1);

        let records = vec![rejected("rambling answer", ExecutionPath::Deep)];
        let finding = catalogue.most_frequent(&records).unwrap();
        assert_eq!(finding.pattern.amendment, "Be brief.");

        let records = vec![rejected("wrong contract clause", ExecutionPath::Deep), rejected("contract", ExecutionPath::Deep)];
        assert_eq!(catalogue.most_frequent(&records).unwrap().pattern.id, "legal_terms");
    }
}
