//! Uniform capability interface over inference backends.
//!
//! The router only ever talks to a [`ModelGateway`]; concrete backends
//! (keyword heuristics, Ollama, Gemini) are composed behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Raw classifier output. The label is free text until the router
/// validates it; a label it cannot parse is treated as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentVerdict {
    pub label: String,
    pub confidence: f64,
}

/// Fast-path generation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastGeneration {
    pub content: String,
    pub latency_ms: u64,
}

/// Deep-path generation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepGeneration {
    pub content: String,
    pub trace: String,
    pub latency_ms: u64,
}

/// Additional context handed to the deep path.
#[derive(Debug, Clone, Default)]
pub struct DeepContext {
    /// System prompt assembled from the active operating instructions.
    pub system_prompt: String,
    /// Verifier findings from a rejected first attempt. Empty on attempt 1.
    pub rejection_reasons: Vec<String>,
    /// 1 for the first attempt, 2 for the single regeneration.
    pub attempt: u8,
}

impl DeepContext {
    /// User-turn text with rejection reasons folded in, for backends that
    /// take a single prompt.
    pub fn user_prompt(&self, text: &str) -> String {
        if self.rejection_reasons.is_empty() {
            return text.to_string();
        }
        let mut prompt = format!("{text}\n\n## Corrections required\n");
        prompt.push_str(
            "A previous draft was rejected because these claims are not supported by the knowledge base. \
             Correct them or remove them:\n",
        );
        for reason in &self.rejection_reasons {
            prompt.push_str("- ");
            prompt.push_str(reason);
            prompt.push('\n');
        }
        prompt
    }
}

/// Capability interface consumed by the router.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Backend identifier for logs.
    fn name(&self) -> &str;

    /// Whether the backend currently answers. Reported by `/health`.
    async fn available(&self) -> bool {
        true
    }

    /// Intent label and confidence for a directive.
    async fn classify(&self, text: &str) -> anyhow::Result<IntentVerdict>;

    /// Single low-latency generation.
    async fn generate_fast(&self, text: &str, system_prompt: &str)
        -> anyhow::Result<FastGeneration>;

    /// Multi-step reasoning; opaque to the router, yields content + trace.
    async fn generate_deep(&self, text: &str, context: &DeepContext)
        -> anyhow::Result<DeepGeneration>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_without_reasons_is_verbatim() {
        let ctx = DeepContext::default();
        assert_eq!(ctx.user_prompt("plan Q3"), "plan Q3");
    }

    #[test]
    fn user_prompt_lists_rejection_reasons() {
        let ctx = DeepContext {
            system_prompt: String::new(),
            rejection_reasons: vec!["Enterprise tier is $10k".into()],
            attempt: 2,
        };
        let prompt = ctx.user_prompt("plan Q3");
        assert!(prompt.starts_with("plan Q3"));
        assert!(prompt.contains("## Corrections required"));
        assert!(prompt.contains("- Enterprise tier is $10k"));
    }
}
