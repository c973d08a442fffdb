//! Model request/response types
//!
//! Provider-agnostic chat types. Each completion call is independent; no
//! conversation state is kept between calls.

use serde::{Deserialize, Serialize};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A message in a completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call model parameters
#[derive(Debug, Clone)]
pub struct ModelCallConfig {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_output_tokens: u32,
    pub timeout_ms: u64,
    /// Transient-error retries; also bounds the JSON repair loop
    pub retries: u32,
}

impl Default for ModelCallConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_output_tokens: 4096,
            timeout_ms: 120_000,
            retries: 2,
        }
    }
}

/// Raw token counts and latency from one or more calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

impl ModelUsage {
    /// Fold another call's usage into this one
    pub fn absorb(&mut self, other: &ModelUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.latency_ms += other.latency_ms;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A plain-text completion
#[derive(Debug, Clone)]
pub struct TextCompletion {
    pub text: String,
    pub usage: ModelUsage,
    pub model: String,
}

/// A schema-validated JSON completion
#[derive(Debug, Clone)]
pub struct JsonCompletion<T> {
    pub parsed: T,
    /// Raw text of the final (accepted) response
    pub text: String,
    /// Usage summed over every attempt, repairs included
    pub usage: ModelUsage,
    pub model: String,
}
