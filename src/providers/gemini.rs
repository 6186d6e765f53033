//! Gemini backend for the deep path.
//!
//! Requests thinking output so the model's thought parts can be returned as
//! the reasoning trace; answer parts become the content.

use std::time::{Duration, Instant};

use super::ollama::elapsed_ms;
use super::traits::DeepGeneration;

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Deep-path client for the Gemini `generateContent` API.
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_ENDPOINT)
    }

    /// Point the client at a different API root (proxies, tests).
    pub fn with_base_url(api_key: String, model: String, base_url: &str) -> Self {
        Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(180))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate_deep(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<DeepGeneration> {
        let start = Instant::now();

        let mut payload = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": user_prompt }]
            }],
            "generationConfig": {
                "temperature": 0.4,
                "maxOutputTokens": 8192,
                "thinkingConfig": { "includeThoughts": true }
            }
        });
        if !system_prompt.trim().is_empty() {
            payload["systemInstruction"] = serde_json::json!({
                "parts": [{ "text": system_prompt }]
            });
        }

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {}: {}", status, body);
        }

        let body: serde_json::Value = resp.json().await?;
        let (thoughts, answer) = split_parts(&body);
        if answer.trim().is_empty() {
            anyhow::bail!("Gemini returned no answer text");
        }

        let trace = if thoughts.trim().is_empty() {
            format!("{}: no reasoning exposed", self.model)
        } else {
            thoughts.trim().to_string()
        };

        Ok(DeepGeneration {
            content: answer.trim().to_string(),
            trace,
            latency_ms: elapsed_ms(start),
        })
    }
}

/// Separate thought parts from answer parts of the first candidate.
fn split_parts(body: &serde_json::Value) -> (String, String) {
    let mut thoughts = String::new();
    let mut answer = String::new();
    let parts = body["candidates"][0]["content"]["parts"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    for part in parts {
        let Some(text) = part["text"].as_str() else {
            continue;
        };
        let target = if part["thought"].as_bool().unwrap_or(false) {
            &mut thoughts
        } else {
            &mut answer
        };
        if !target.is_empty() {
            target.push('\n');
        }
        target.push_str(text);
    }
    (thoughts, answer)
}
