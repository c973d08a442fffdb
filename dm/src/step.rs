//! Step trace domain types
//!
//! A StepTrace records one phase of one agent-loop iteration. The four
//! phases of an iteration share a stepIndex; rows are ordered by insertion
//! id within it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::now_ms;

/// Phase of one agent-loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Retrieve,
    Plan,
    Act,
    Reflect,
}

impl StepPhase {
    pub fn parse(s: &str) -> Option<StepPhase> {
        match s {
            "retrieve" => Some(Self::Retrieve),
            "plan" => Some(Self::Plan),
            "act" => Some(Self::Act),
            "reflect" => Some(Self::Reflect),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Retrieve => "retrieve",
            Self::Plan => "plan",
            Self::Act => "act",
            Self::Reflect => "reflect",
        };
        write!(f, "{}", s)
    }
}

/// Reference to a ranked chunk, small enough to store per step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    pub source_url: String,
    pub snippet_hash: String,
    pub score: f64,
}

/// The query and ranked chunks attached to retrieve/act steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalAttachment {
    pub query: String,
    pub chunks: Vec<ChunkRef>,
}

/// The continue/stop decision recorded on reflect steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDecision {
    pub should_continue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// One persisted step of an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTrace {
    /// Store-assigned insertion id; zero until persisted
    #[serde(default)]
    pub id: i64,
    pub task_execution_id: String,
    pub step_index: u32,
    pub phase: StepPhase,
    pub input: Value,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<crate::execution::CallUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<StepDecision>,
    pub created_at: i64,
}

impl StepTrace {
    pub fn new(task_execution_id: &str, step_index: u32, phase: StepPhase) -> Self {
        Self {
            id: 0,
            task_execution_id: task_execution_id.to_string(),
            step_index,
            phase,
            input: Value::Null,
            output: Value::Null,
            retrieval: None,
            usage: None,
            decision: None,
            created_at: now_ms(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalAttachment) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_usage(mut self, usage: crate::execution::CallUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_decision(mut self, decision: StepDecision) -> Self {
        self.decision = Some(decision);
        self
    }
}

/// Evidence pointer attached to an act step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCitation {
    /// Parent step insertion id; zero until persisted
    #[serde(default)]
    pub step_id: i64,
    pub source: String,
    #[serde(default)]
    pub snippet_hash: String,
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<u32>,
}
