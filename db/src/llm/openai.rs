//! OpenAI-compatible chat completions client
//!
//! One HTTP provider covers the model seam; anything speaking the Chat
//! Completions wire shape (hosted or proxied) plugs in via `base_url`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ChatMessage, ChatRole, ModelCallConfig, ModelClient, ModelError, ModelUsage, TextCompletion};

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Check if an HTTP status code is retryable
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// OpenAI-compatible API client
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ModelError> {
        let http = Client::builder().build().map_err(ModelError::Network)?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            http,
        })
    }

    /// Read the API key from an environment variable
    pub fn from_env(base_url: impl Into<String>, api_key_env: &str) -> Result<Self, ModelError> {
        let api_key = std::env::var(api_key_env).map_err(|_| {
            ModelError::InvalidResponse(format!("environment variable {} is not set", api_key_env))
        })?;
        Self::new(base_url, api_key)
    }

    fn build_request_body(&self, config: &ModelCallConfig, messages: &[ChatMessage]) -> serde_json::Value {
        debug!(model = %config.model, count = messages.len(), "build_request_body");
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                };
                serde_json::json!({"role": role, "content": m.content})
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "messages": messages,
            "max_tokens": config.max_output_tokens,
        });
        if let Some(temperature) = config.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete_text(
        &self,
        config: &ModelCallConfig,
        messages: &[ChatMessage],
    ) -> Result<TextCompletion, ModelError> {
        debug!(model = %config.model, "complete_text: called");
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_request_body(config, messages);
        let timeout = Duration::from_millis(config.timeout_ms);

        let mut last_error = None;
        for attempt in 0..=config.retries {
            if attempt > 0 {
                let backoff = INITIAL_BACKOFF_MS * u64::from(attempt);
                warn!(attempt, backoff_ms = backoff, "complete_text: retrying after backoff");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let started = Instant::now();
            let response = self
                .http
                .post(&url)
                .timeout(timeout)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    let err = ModelError::Network(e);
                    if err.is_retryable() {
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            };

            let status = response.status().as_u16();
            if status != 200 {
                let message = response.text().await.unwrap_or_default();
                let err = ModelError::Api { status, message };
                if is_retryable_status(status) {
                    last_error = Some(err);
                    continue;
                }
                return Err(err);
            }

            let latency_ms = started.elapsed().as_millis() as u64;
            let api: ApiResponse = response.json().await.map_err(ModelError::Network)?;
            let text = api
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| ModelError::InvalidResponse("response has no choices".to_string()))?;

            return Ok(TextCompletion {
                text,
                usage: ModelUsage {
                    input_tokens: api.usage.prompt_tokens,
                    output_tokens: api.usage.completion_tokens,
                    latency_ms,
                },
                model: config.model.clone(),
            });
        }

        Err(last_error.unwrap_or_else(|| {
            ModelError::InvalidResponse("request retries exhausted without a response".to_string())
        }))
    }
}
