//! Offline keyword classifier.
//!
//! Used when no small model is configured for classification. Emits a
//! confidence like a model would, so the router's tie-break rule applies
//! uniformly regardless of the backend.

use crate::directive::Intent;

use super::traits::IntentVerdict;

/// Words that signal a strategic, multi-step request.
const STRATEGY_KEYWORDS: &[&str] = &[
    "plan",
    "planning",
    "strategy",
    "strategic",
    "design",
    "architecture",
    "build",
    "create",
    "analyze",
    "analyse",
    "analysis",
    "research",
    "develop",
    "roadmap",
    "go-to-market",
    "compare",
    "evaluate",
    "recommend",
];

/// Words that signal a quick lookup or action.
const QUICK_KEYWORDS: &[&str] = &[
    "what", "how", "show", "list", "get", "when", "who", "where", "define", "convert",
];

/// Quick indicators only count on inputs shorter than this.
const QUICK_MAX_CHARS: usize = 100;

/// Unmatched inputs shorter than this are tried on the fast path.
const SHORT_MESSAGE_CHARS: usize = 20;

/// Keyword-based intent classifier.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a directive using keyword heuristics.
    pub fn classify(&self, text: &str) -> IntentVerdict {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '-'))
            .filter(|w| !w.is_empty())
            .collect();
        let chars = text.chars().count();

        // 1. Strategy keywords dominate: each extra hit raises confidence.
        let strategy_hits = words
            .iter()
            .filter(|w| STRATEGY_KEYWORDS.contains(w))
            .count();
        if strategy_hits > 0 {
            let confidence = (0.8 + 0.05 * (strategy_hits - 1) as f64).min(0.95);
            return verdict(Intent::Strategy, confidence);
        }

        // 2. Quick indicators on short input.
        let quick_hit = lower.contains('?') || words.iter().any(|w| QUICK_KEYWORDS.contains(w));
        if quick_hit && chars < QUICK_MAX_CHARS {
            return verdict(Intent::Quick, 0.9);
        }

        // 3. Very short, unmatched input: try fast, but below the default
        //    threshold so the tie-break still applies.
        if chars < SHORT_MESSAGE_CHARS {
            return verdict(Intent::Quick, 0.55);
        }

        // 4. Ambiguous: deeper reasoning.
        verdict(Intent::Strategy, 0.6)
    }
}

fn verdict(intent: Intent, confidence: f64) -> IntentVerdict {
    IntentVerdict {
        label: intent.as_str().to_string(),
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(text: &str) -> (String, f64) {
        let v = KeywordClassifier::new().classify(text);
        (v.label, v.confidence)
    }

    #[test]
    fn arithmetic_question_is_quick() {
        let (l, c) = label("What is 2+2?");
        assert_eq!(l, "quick");
        assert!(c >= 0.9);
    }

    #[test]
    fn go_to_market_is_strategy() {
        let (l, c) = label("Build a go-to-market strategy for Q3");
        assert_eq!(l, "strategy");
        assert!(c > 0.8);
    }

    #[test]
    fn strategy_beats_quick_indicator() {
        let (l, _) = label("How should we design the pricing architecture?");
        assert_eq!(l, "strategy");
    }

    #[test]
    fn keywords_match_whole_words_only() {
        // "planet" must not trigger "plan", "showcase" must not trigger "show".
        let (l, _) = label("planet showcase");
        assert_eq!(l, "quick");
        let (_, c) = label("planet showcase");
        assert!(c < 0.6);
    }

    #[test]
    fn long_unmatched_input_goes_deep() {
        let (l, c) = label(
            "I keep thinking about the quarterly numbers and the way the team feels about them lately",
        );
        assert_eq!(l, "strategy");
        assert!((c - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn long_question_is_not_quick() {
        let text = format!("what {}?", "about this ".repeat(12));
        let (l, _) = label(&text);
        assert_eq!(l, "strategy");
    }
}
