//! Evaluation domain types
//!
//! Deterministic check results and the rubric judge's verdict. A pass needs
//! both validity (grounded, no deterministic blocks) and quality (rubric
//! average at or above 7).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Categorical diagnosis of why a task failed; closed set of eight values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    OutdatedContent,
    BrokenLinks,
    MissingExamples,
    AmbiguousInstructions,
    ConflictingInformation,
    MissingContent,
    InsufficientDetail,
    PoorStructure,
}

impl FailureClass {
    pub const ALL: [FailureClass; 8] = [
        Self::OutdatedContent,
        Self::BrokenLinks,
        Self::MissingExamples,
        Self::AmbiguousInstructions,
        Self::ConflictingInformation,
        Self::MissingContent,
        Self::InsufficientDetail,
        Self::PoorStructure,
    ];

    pub fn parse(s: &str) -> Option<FailureClass> {
        match s {
            "outdated_content" => Some(Self::OutdatedContent),
            "broken_links" => Some(Self::BrokenLinks),
            "missing_examples" => Some(Self::MissingExamples),
            "ambiguous_instructions" => Some(Self::AmbiguousInstructions),
            "conflicting_information" => Some(Self::ConflictingInformation),
            "missing_content" => Some(Self::MissingContent),
            "insufficient_detail" => Some(Self::InsufficientDetail),
            "poor_structure" => Some(Self::PoorStructure),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OutdatedContent => "outdated_content",
            Self::BrokenLinks => "broken_links",
            Self::MissingExamples => "missing_examples",
            Self::AmbiguousInstructions => "ambiguous_instructions",
            Self::ConflictingInformation => "conflicting_information",
            Self::MissingContent => "missing_content",
            Self::InsufficientDetail => "insufficient_detail",
            Self::PoorStructure => "poor_structure",
        };
        write!(f, "{}", s)
    }
}

/// The four rubric criteria plus their mean, each in [0, 10]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CriterionScores {
    pub completeness: f64,
    pub correctness: f64,
    pub groundedness: f64,
    pub actionability: f64,
    pub average: f64,
}

impl CriterionScores {
    pub fn with_average(completeness: f64, correctness: f64, groundedness: f64, actionability: f64) -> Self {
        let mut scores = Self {
            completeness,
            correctness,
            groundedness,
            actionability,
            average: 0.0,
        };
        scores.recompute_average();
        scores
    }

    /// Mean of the four criteria
    pub fn recompute_average(&mut self) {
        self.average =
            (self.completeness + self.correctness + self.groundedness + self.actionability) / 4.0;
    }

    pub fn clamp_all(&mut self) {
        self.completeness = self.completeness.clamp(0.0, 10.0);
        self.correctness = self.correctness.clamp(0.0, 10.0);
        self.groundedness = self.groundedness.clamp(0.0, 10.0);
        self.actionability = self.actionability.clamp(0.0, 10.0);
    }
}

/// One non-LLM check outcome, persisted for post-hoc inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeterministicCheckResult {
    pub task_execution_id: String,
    pub name: String,
    pub passed: bool,
    pub score_delta: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// The judge's verdict for one task within one phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvaluation {
    pub run_id: String,
    pub task_id: String,
    pub phase: crate::execution::EvalPhase,
    pub criterion_scores: CriterionScores,
    pub pass: bool,
    pub quality_pass: bool,
    pub validity_pass: bool,
    pub validity_blocked_reasons: Vec<String>,
    pub failure_class: Option<FailureClass>,
    pub rationale: String,
    pub judge_model: String,
    pub confidence: f64,
}
