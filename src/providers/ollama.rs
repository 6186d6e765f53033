//! Ollama backend: fast-path chat, small-model classification and the local
//! deep model used when no cloud key is configured.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::traits::{DeepGeneration, FastGeneration, IntentVerdict};

/// Default request timeout. The router applies its own tighter bounds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

const CLASSIFY_SYSTEM_PROMPT: &str = "Classify the user's request. \
Reply with JSON only: {\"label\": \"quick\" | \"strategy\", \"confidence\": <0..1>}. \
\"quick\" = a short factual answer or simple action. \
\"strategy\" = planning, analysis, design or anything needing multi-step reasoning.";

/// Ollama chat request (native API format, not OpenAI-compatible).
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
}

/// Ollama chat response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct SlmClassification {
    label: String,
    confidence: f64,
}

/// HTTP client for a local Ollama server.
pub struct OllamaClient {
    base_url: String,
    fast_model: String,
    classifier_model: String,
    deep_model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, fast_model: &str, classifier_model: &str, deep_model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').trim_end_matches("/v1").to_string(),
            fast_model: fast_model.to_string(),
            classifier_model: classifier_model.to_string(),
            deep_model: deep_model.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn deep_model(&self) -> &str {
        &self.deep_model
    }

    /// Check if Ollama is reachable.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }

    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f64,
        format: Option<&str>,
    ) -> anyhow::Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let mut messages = Vec::with_capacity(2);
        if !system.trim().is_empty() {
            messages.push(OllamaMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(OllamaMessage {
            role: "user",
            content: user,
        });
        let body = OllamaChatRequest {
            model,
            messages,
            stream: false,
            format,
            options: OllamaOptions { temperature },
        };

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("Ollama returned status {}", resp.status());
        }

        let chat_resp: OllamaChatResponse = resp.json().await?;
        let content = chat_resp.message.content.trim().to_string();
        if content.is_empty() {
            anyhow::bail!("Ollama returned empty response");
        }
        Ok(content)
    }

    /// Classify intent with the small local model.
    pub async fn classify(&self, text: &str) -> anyhow::Result<IntentVerdict> {
        let raw = self
            .chat(&self.classifier_model, CLASSIFY_SYSTEM_PROMPT, text, 0.0, Some("json"))
            .await?;
        let (_, answer) = split_think(&raw);
        let parsed: SlmClassification = serde_json::from_str(answer.trim())
            .with_context(|| format!("unparseable classifier output: {answer}"))?;
        Ok(IntentVerdict {
            label: parsed.label,
            confidence: parsed.confidence,
        })
    }

    /// Single fast-path completion.
    pub async fn generate_fast(&self, text: &str, system_prompt: &str) -> anyhow::Result<FastGeneration> {
        let start = Instant::now();
        let raw = self.chat(&self.fast_model, system_prompt, text, 0.7, None).await?;
        let (_, answer) = split_think(&raw);
        Ok(FastGeneration {
            content: answer.trim().to_string(),
            latency_ms: elapsed_ms(start),
        })
    }

    /// Deep-path completion on the local deep model. A `<think>` block, when
    /// the model emits one, becomes the reasoning trace.
    pub async fn generate_deep(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<DeepGeneration> {
        let start = Instant::now();
        let raw = self
            .chat(&self.deep_model, system_prompt, user_prompt, 0.4, None)
            .await?;
        let (think, answer) = split_think(&raw);
        let answer = answer.trim();
        if answer.is_empty() {
            anyhow::bail!("deep model produced reasoning but no answer");
        }
        let trace = think
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("{}: no reasoning exposed", self.deep_model));
        Ok(DeepGeneration {
            content: answer.to_string(),
            trace,
            latency_ms: elapsed_ms(start),
        })
    }
}

/// Split a `<think>...</think>` prefix off model output.
pub(crate) fn split_think(raw: &str) -> (Option<&str>, &str) {
    let trimmed = raw.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<think>") {
        if let Some(end) = rest.find("</think>") {
            return (Some(&rest[..end]), &rest[end + "</think>".len()..]);
        }
    }
    (None, raw)
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OllamaClient {
        OllamaClient::new(&server.uri(), "llama3", "qwen3:0.6b", "qwen3:8b")
    }

    fn chat_reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": { "role": "assistant", "content": content }
        }))
    }

    #[test]
    fn split_think_extracts_reasoning() {
        let (think, answer) = split_think("<think>step 1</think>\nFinal");
        assert_eq!(think, Some("step 1"));
        assert_eq!(answer.trim(), "Final");

        let (think, answer) = split_think("no reasoning");
        assert!(think.is_none());
        assert_eq!(answer, "no reasoning");
    }

    #[test]
    fn base_url_strips_openai_suffix() {
        let client = OllamaClient::new("http://127.0.0.1:11434/v1", "a", "b", "c");
        assert_eq!(client.base_url(), "http://127.0.0.1:11434");
    }

    #[tokio::test]
    async fn classify_parses_json_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply(r#"{"label": "quick", "confidence": 0.93}"#))
            .mount(&server)
            .await;

        let verdict = client_for(&server).classify("What is 2+2?").await.unwrap();
        assert_eq!(verdict.label, "quick");
        assert!((verdict.confidence - 0.93).abs() < 1e-9);
    }

    #[tokio::test]
    async fn classify_rejects_non_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply("I think it's quick"))
            .mount(&server)
            .await;

        assert!(client_for(&server).classify("hi").await.is_err());
    }

    #[tokio::test]
    async fn fast_generation_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply("4"))
            .mount(&server)
            .await;

        let out = client_for(&server).generate_fast("What is 2+2?", "be brief").await.unwrap();
        assert_eq!(out.content, "4");
    }

    #[tokio::test]
    async fn deep_generation_uses_think_block_as_trace() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply("<think>1. segment market</think>Launch in EMEA first."))
            .mount(&server)
            .await;

        let out = client_for(&server).generate_deep("sys", "plan").await.unwrap();
        assert_eq!(out.trace, "1. segment market");
        assert_eq!(out.content, "Launch in EMEA first.");
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client_for(&server).generate_fast("x", "").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn health_check_hits_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;

        assert!(client_for(&server).check_health().await);
    }
}
