//! Local/cloud composite gateway.
//!
//! Classification and the fast path stay local (keyword heuristics or a
//! small Ollama model, then an Ollama chat model). The deep path goes to
//! Gemini when a key is available and to the local deep model otherwise.

use async_trait::async_trait;

use crate::config::{ClassifierKind, ProvidersConfig};

use super::gemini::GeminiClient;
use super::keyword::KeywordClassifier;
use super::ollama::OllamaClient;
use super::traits::{DeepContext, DeepGeneration, FastGeneration, IntentVerdict, ModelGateway};

enum Classifier {
    Keyword(KeywordClassifier),
    Slm,
}

/// Production [`ModelGateway`].
pub struct HybridGateway {
    name: String,
    classifier: Classifier,
    ollama: OllamaClient,
    gemini: Option<GeminiClient>,
}

impl HybridGateway {
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let ollama = OllamaClient::new(
            &config.ollama_url,
            &config.fast_model,
            &config.classifier_model,
            &config.deep_model,
        );
        let gemini = config
            .resolved_gemini_key()
            .map(|key| GeminiClient::new(key, config.gemini_model.clone()));
        Self::new(config.classifier, ollama, gemini)
    }

    pub fn new(classifier: ClassifierKind, ollama: OllamaClient, gemini: Option<GeminiClient>) -> Self {
        let deep = match gemini {
            Some(ref g) => format!("gemini:{}", g.model()),
            None => format!("ollama:{}", ollama.deep_model()),
        };
        let classifier = match classifier {
            ClassifierKind::Keyword => Classifier::Keyword(KeywordClassifier::new()),
            ClassifierKind::Slm => Classifier::Slm,
        };
        Self {
            name: format!("hybrid(deep={deep})"),
            classifier,
            ollama,
            gemini,
        }
    }
}

#[async_trait]
impl ModelGateway for HybridGateway {
    fn name(&self) -> &str {
        &self.name
    }

    /// Classification (SLM) and the fast path need the local server.
    async fn available(&self) -> bool {
        self.ollama.check_health().await
    }

    async fn classify(&self, text: &str) -> anyhow::Result<IntentVerdict> {
        match self.classifier {
            Classifier::Keyword(ref keyword) => Ok(keyword.classify(text)),
            Classifier::Slm => self.ollama.classify(text).await,
        }
    }

    async fn generate_fast(&self, text: &str, system_prompt: &str) -> anyhow::Result<FastGeneration> {
        self.ollama.generate_fast(text, system_prompt).await
    }

    async fn generate_deep(&self, text: &str, context: &DeepContext) -> anyhow::Result<DeepGeneration> {
        let user_prompt = context.user_prompt(text);
        match self.gemini {
            Some(ref gemini) => gemini.generate_deep(&context.system_prompt, &user_prompt).await,
            None => self.ollama.generate_deep(&context.system_prompt, &user_prompt).await,
        }
    }
}
