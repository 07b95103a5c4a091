//! Generation provider trait and Anthropic messages-API client.
//!
//! Three operations: `classify` (small JSON routing decisions), `complete`
//! (non-streamed text, used for conversation summaries), and `stream`
//! (token deltas over a channel). Streamed deltas stop being read the moment
//! the receiver is dropped, which is how answer cancellation propagates.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::GenerationConfig;
use crate::error::{PipelineError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A text-generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Ask for a structured JSON decision. The returned value is the parsed
    /// JSON object from the model's reply.
    async fn classify(&self, prompt: &str) -> Result<serde_json::Value>;

    /// One-shot completion, fully buffered.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    /// Streamed completion. Each item is one text delta; the stream ends when
    /// the sender side closes (normally or with a trailing Err).
    async fn stream(&self, system: &str, prompt: &str) -> Result<mpsc::Receiver<Result<String>>>;
}

// ============ Anthropic REST provider ============

pub struct AnthropicProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    classify_model: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
}

impl AnthropicProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            PipelineError::permanent(
                "generation",
                format!("{} environment variable not set", config.api_key_env),
            )
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::permanent("generation", e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            classify_model: config
                .classify_model
                .clone()
                .unwrap_or_else(|| config.model.clone()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries.max(1),
        })
    }

    fn message_body(
        &self,
        model: &str,
        system: Option<&str>,
        prompt: &str,
        max_tokens: u32,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": self.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    /// Send a non-streaming messages request with retry, returning the text
    /// of the first content block.
    async fn send_message(&self, body: serde_json::Value) -> Result<String> {
        let url = format!("{}/messages", self.base_url);
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let response = self
                .http
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: serde_json::Value = resp.json().await.map_err(|e| {
                            PipelineError::permanent("generation", e.to_string())
                        })?;
                        return parsed["content"][0]["text"]
                            .as_str()
                            .map(|s| s.to_string())
                            .ok_or_else(|| {
                                PipelineError::permanent("generation", "no text in response")
                            });
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = format!("HTTP {}", status);
                    } else {
                        let detail = resp.text().await.unwrap_or_default();
                        return Err(PipelineError::permanent(
                            "generation",
                            format!("HTTP {}: {}", status, detail),
                        ));
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_retries {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(
                    attempt,
                    max = self.max_retries,
                    error = %last_error,
                    "generation request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(PipelineError::transient(
            "generation",
            self.max_retries,
            last_error,
        ))
    }
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    async fn classify(&self, prompt: &str) -> Result<serde_json::Value> {
        let body = self.message_body(&self.classify_model, None, prompt, 512, false);
        let text = self.send_message(body).await?;
        parse_json_reply(&text)
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = self.message_body(&self.model, Some(system), prompt, self.max_tokens, false);
        self.send_message(body).await
    }

    async fn stream(&self, system: &str, prompt: &str) -> Result<mpsc::Receiver<Result<String>>> {
        let body = self.message_body(&self.model, Some(system), prompt, self.max_tokens, true);
        let url = format!("{}/messages", self.base_url);

        let resp = self
            .http
            .post(&url)
            // The client-wide timeout covers whole responses; a streamed
            // answer can legitimately run much longer than that.
            .timeout(Duration::from_secs(600))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::transient("generation", 1, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let err = format!("HTTP {}: {}", status, detail);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                PipelineError::transient("generation", 1, err)
            } else {
                PipelineError::permanent("generation", err)
            });
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(PipelineError::transient("generation", 1, e.to_string())))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    if let Some(delta) = parse_sse_line(&line) {
                        // Receiver gone means the answer was cancelled; stop
                        // reading from the provider.
                        if tx.send(Ok(delta)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Extract the text delta from one SSE data line, if it carries one.
fn parse_sse_line(line: &str) -> Option<String> {
    let data = line.strip_prefix("data: ")?;
    let event: serde_json::Value = serde_json::from_str(data).ok()?;
    if event["type"].as_str()? != "content_block_delta" {
        return None;
    }
    event["delta"]["text"].as_str().map(|s| s.to_string())
}

/// Parse a model reply that should be a JSON object, tolerating markdown
/// code fences around it.
pub fn parse_json_reply(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    serde_json::from_str(inner)
        .map_err(|e| PipelineError::permanent("generation", format!("invalid JSON reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_reply_bare() {
        let v = parse_json_reply(r#"{"skip_rag": true}"#).unwrap();
        assert_eq!(v["skip_rag"], true);
    }

    #[test]
    fn test_parse_json_reply_fenced() {
        let v = parse_json_reply("```json\n{\"needs_decomposition\": false}\n```").unwrap();
        assert_eq!(v["needs_decomposition"], false);
    }

    #[test]
    fn test_parse_json_reply_garbage_rejected() {
        assert!(parse_json_reply("I think the answer is yes").is_err());
    }

    #[test]
    fn test_parse_sse_delta_line() {
        let line = r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#;
        assert_eq!(parse_sse_line(line), Some("Hello".to_string()));
    }

    #[test]
    fn test_parse_sse_ignores_other_events() {
        assert_eq!(parse_sse_line(r#"data: {"type":"message_start"}"#), None);
        assert_eq!(parse_sse_line("event: ping"), None);
        assert_eq!(parse_sse_line(""), None);
    }
}
