//! Schema-validated JSON completions
//!
//! Models wrap JSON in fences, preamble prose, or trailing commentary. The
//! extractor takes the first balanced object or array; validation is a typed
//! serde decode. On failure the raw response is echoed back with a repair
//! instruction, up to min(3, retries + 1) attempts, and usage is summed over
//! every attempt so budgets see the real spend.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{ChatMessage, JsonCompletion, ModelCallConfig, ModelClient, ModelError};

/// Render the JSON Schema of `T` for embedding in prompts
pub fn schema_of<T: JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// Extract the first balanced `{...}` or `[...]` from text
///
/// String literals and escapes are respected so braces inside values do not
/// unbalance the scan. Returns None when no balanced value exists.
pub fn extract_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Complete and decode as `T`, repairing on validation failure
pub async fn complete_json<T: DeserializeOwned>(
    client: &dyn ModelClient,
    config: &ModelCallConfig,
    messages: Vec<ChatMessage>,
    schema_hint: &str,
) -> Result<JsonCompletion<T>, ModelError> {
    let max_attempts = (config.retries + 1).min(3);
    let mut messages = messages;
    let mut usage = super::ModelUsage::default();
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let completion = client.complete_text(config, &messages).await?;
        usage.absorb(&completion.usage);

        let candidate = extract_json(&completion.text).unwrap_or(completion.text.as_str());
        match serde_json::from_str::<T>(candidate) {
            Ok(parsed) => {
                debug!(attempt, model = %completion.model, "complete_json: validated");
                return Ok(JsonCompletion {
                    parsed,
                    text: completion.text,
                    usage,
                    model: completion.model,
                });
            }
            Err(e) => {
                warn!(attempt, error = %e, "complete_json: validation failed");
                last_error = e.to_string();
                messages.push(ChatMessage::assistant(completion.text));
                messages.push(ChatMessage::user(format!(
                    "That response did not validate: {}. Reply with ONLY a JSON value \
                     matching this schema, no prose and no code fences:\n{}",
                    last_error, schema_hint
                )));
            }
        }
    }

    Err(ModelError::SchemaValidation {
        attempts: max_attempts,
        last_error,
    })
}
