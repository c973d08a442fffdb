//! ModelClient trait definition

use async_trait::async_trait;

use super::{ChatMessage, ModelCallConfig, ModelError, TextCompletion};

/// Stateless model client - each call is independent
///
/// This is the seam between the orchestrator and any provider. Structured
/// JSON completions are layered on top in [`super::json`], so providers only
/// implement plain text.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete_text(
        &self,
        config: &ModelCallConfig,
        messages: &[ChatMessage],
    ) -> Result<TextCompletion, ModelError>;
}

pub mod mock {
    //! Deterministic in-process client for tests and offline demos
    //!
    //! Responses are routed by marker substrings matched against the request
    //! messages, so concurrent callers with different prompts stay
    //! deterministic. Each rule pops queued responses in order and keeps
    //! repeating the last one once the queue is down to a single entry.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tracing::debug;

    use super::super::{ChatMessage, ModelCallConfig, ModelError, ModelUsage, TextCompletion};
    use super::ModelClient;

    struct MockRule {
        marker: String,
        responses: VecDeque<String>,
    }

    /// Mock model client routed by prompt markers
    #[derive(Default)]
    pub struct MockModelClient {
        rules: Mutex<Vec<MockRule>>,
        call_count: AtomicUsize,
    }

    impl MockModelClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Route any request whose messages contain `marker` to `response`
        pub fn respond(&self, marker: impl Into<String>, response: impl Into<String>) {
            self.respond_seq(marker, vec![response.into()]);
        }

        /// Route matching requests to `responses` in order; the final entry
        /// repeats for all later calls
        pub fn respond_seq(&self, marker: impl Into<String>, responses: Vec<String>) {
            let marker = marker.into();
            debug!(%marker, count = responses.len(), "MockModelClient::respond_seq");
            let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(rule) = rules.iter_mut().find(|r| r.marker == marker) {
                rule.responses.extend(responses);
            } else {
                rules.push(MockRule {
                    marker,
                    responses: responses.into(),
                });
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for MockModelClient {
        async fn complete_text(
            &self,
            config: &ModelCallConfig,
            messages: &[ChatMessage],
        ) -> Result<TextCompletion, ModelError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let input_chars: usize = messages.iter().map(|m| m.content.len()).sum();

            let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
            let rule = rules
                .iter_mut()
                .find(|r| messages.iter().any(|m| m.content.contains(&r.marker)));
            let Some(rule) = rule else {
                return Err(ModelError::InvalidResponse(
                    "no mock rule matches the request".to_string(),
                ));
            };
            let text = if rule.responses.len() > 1 {
                rule.responses.pop_front().unwrap_or_default()
            } else {
                rule.responses.front().cloned().unwrap_or_default()
            };
            debug!(marker = %rule.marker, "MockModelClient::complete_text: matched");

            Ok(TextCompletion {
                usage: ModelUsage {
                    input_tokens: (input_chars / 4) as u64,
                    output_tokens: (text.len() / 4) as u64,
                    latency_ms: 1,
                },
                text,
                model: config.model.clone(),
            })
        }
    }

}
