//! OpenAI-compatible chat completions advisor.
//!
//! Defaults to OpenRouter, but any endpoint that speaks the chat
//! completions format works (a local server needs no API key).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{build_prompt, parse_advice, system_prompt, Advisor, AdvisoryContext};
use crate::types::{Advice, EngineError, EngineResult};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
const DEFAULT_MAX_TOKENS: u32 = 256;

/// Maximum retries on rate limit / server errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenRouterAdvisor {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    max_tokens: u32,
}

impl OpenRouterAdvisor {
    pub fn new(
        base_url: Option<&str>,
        api_key: Option<SecretString>,
        model: Option<String>,
        max_tokens: Option<u32>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to build advisor HTTP client")?;

        let base = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/');
        Ok(Self {
            http,
            endpoint: format!("{base}/chat/completions"),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One chat completion with retry + exponential backoff.
    async fn complete(&self, system: &str, user_message: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_message.to_string(),
                },
            ],
        };

        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, model = %self.model, "Retrying advisor call");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let mut builder = self
                .http
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .header("X-Title", "TRADESCOUT");
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key.expose_secret());
            }

            match builder.json(&request).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: ChatResponse = response
                            .json()
                            .await
                            .context("Failed to parse advisor response")?;
                        return Ok(body
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message)
                            .map(|m| m.content)
                            .unwrap_or_default());
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let error_text = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, error = %error_text, "Retryable advisor error");
                        last_error = Some(format!("HTTP {status}: {error_text}"));
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    anyhow::bail!("Advisor API error {status} (model={}): {error_text}", self.model);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Advisor request failed");
                    last_error = Some(format!("Request error: {e}"));
                }
            }
        }

        anyhow::bail!(
            "Advisor API failed after {} retries (model={}): {}",
            MAX_RETRIES,
            self.model,
            last_error.unwrap_or_default()
        )
    }
}

#[async_trait]
impl Advisor for OpenRouterAdvisor {
    async fn advise(&self, context: &AdvisoryContext) -> EngineResult<Advice> {
        let text = self
            .complete(system_prompt(), &build_prompt(context))
            .await
            .map_err(|e| EngineError::Advisory(format!("{e:#}")))?;

        let advice = parse_advice(&text)?;
        info!(
            pair = %context.pair,
            proposed = %context.action,
            advised = %advice.recommendation,
            confidence = format!("{:.2}", advice.confidence),
            "Advisory received"
        );
        Ok(advice)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_construction_defaults() {
        let client = OpenRouterAdvisor::new(None, None, None, None).unwrap();
        assert_eq!(client.model(), DEFAULT_MODEL);
        assert_eq!(client.endpoint, "https://openrouter.ai/api/v1/chat/completions");
        assert_eq!(client.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(client.api_key.is_none());
    }

    #[test]
    fn test_client_custom_endpoint() {
        let client = OpenRouterAdvisor::new(
            Some("http://localhost:11434/v1/"),
            Some(SecretString::new("sk-test".to_string())),
            Some("llama3".into()),
            Some(64),
        )
        .unwrap();
        assert_eq!(client.endpoint, "http://localhost:11434/v1/chat/completions");
        assert_eq!(client.model(), "llama3");
        assert_eq!(client.max_tokens, 64);
        assert_eq!(client.api_key.as_ref().map(|k| k.expose_secret().as_str()), Some("sk-test"));
    }
}
