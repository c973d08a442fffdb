//! Model client module
//!
//! Text and schema-validated JSON completions behind the [`ModelClient`]
//! seam, with one OpenAI-compatible HTTP provider and a marker-routed mock.

pub mod client;
mod error;
pub mod json;
mod openai;
mod types;

pub use client::ModelClient;
pub use client::mock::MockModelClient;
pub use error::ModelError;
pub use json::{complete_json, extract_json, schema_of};
pub use openai::OpenAiClient;
pub use types::{ChatMessage, ChatRole, JsonCompletion, ModelCallConfig, ModelUsage, TextCompletion};
