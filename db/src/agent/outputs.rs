//! Structured outputs of the three agent model calls
//!
//! All fields the model might omit default, so a sparse but well-formed
//! response never fails validation.

use docmodel::StepCitation;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Plan call result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutput {
    #[serde(default)]
    pub plan_items: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

/// A citation the acting model attaches to its answer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActCitation {
    pub source: String,
    #[serde(default)]
    pub snippet_hash: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub start_offset: Option<u32>,
    #[serde(default)]
    pub end_offset: Option<u32>,
}

impl ActCitation {
    pub fn into_step_citation(self) -> StepCitation {
        StepCitation {
            step_id: 0,
            source: self.source,
            snippet_hash: self.snippet_hash,
            excerpt: self.excerpt,
            start_offset: self.start_offset,
            end_offset: self.end_offset,
        }
    }
}

/// Act call result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActOutput {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub step_output: String,
    #[serde(default)]
    pub citations: Vec<ActCitation>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub discovered_facts: Vec<String>,
}

/// Reflect call result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReflectOutput {
    pub should_continue: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub plan_updates: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub stop_reason: Option<String>,
}
