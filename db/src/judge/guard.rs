//! Deterministic guard
//!
//! Non-LLM gate over an attempt. Each check records a persisted result, may
//! clamp a rubric criterion with a cap, and may add a validity block that
//! forces the final pass to false regardless of scores.

use docmodel::{CriterionScores, DeterministicCheckResult, StopReason, Task};
use serde_json::json;
use tracing::debug;

use super::Attempt;
use crate::retrieval::RetrievalIndex;

/// Minimum expected-signal coverage for the coverage check
pub const SIGNAL_COVERAGE_THRESHOLD: f64 = 0.45;

/// Lowercase and collapse whitespace
pub fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fraction of expected signals present in the text as substrings after
/// normalization. No signals means full coverage.
pub fn signal_coverage(text: &str, signals: &[String]) -> f64 {
    if signals.is_empty() {
        return 1.0;
    }
    let haystack = normalize(text);
    let matched = signals
        .iter()
        .map(|s| normalize(s))
        .filter(|s| !s.is_empty() && haystack.contains(s.as_str()))
        .count();
    matched as f64 / signals.len() as f64
}

/// Upper bounds the guard imposes on rubric criteria
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreCaps {
    pub completeness: f64,
    pub correctness: f64,
    pub groundedness: f64,
    pub actionability: f64,
}

impl Default for ScoreCaps {
    fn default() -> Self {
        Self {
            completeness: 10.0,
            correctness: 10.0,
            groundedness: 10.0,
            actionability: 10.0,
        }
    }
}

impl ScoreCaps {
    pub fn apply(&self, scores: &mut CriterionScores) {
        scores.completeness = scores.completeness.min(self.completeness);
        scores.correctness = scores.correctness.min(self.correctness);
        scores.groundedness = scores.groundedness.min(self.groundedness);
        scores.actionability = scores.actionability.min(self.actionability);
    }
}

/// Everything the guard concluded about one attempt
#[derive(Debug, Clone, Default)]
pub struct GuardOutcome {
    pub caps: ScoreCaps,
    pub validity_blocked_reasons: Vec<String>,
    pub checks: Vec<DeterministicCheckResult>,
}

impl GuardOutcome {
    pub fn blocked(&self) -> bool {
        !self.validity_blocked_reasons.is_empty()
    }
}

/// Run every deterministic check against one attempt
pub fn run_checks(
    exec_id: &str,
    task: &Task,
    attempt: &Attempt,
    step_count: u32,
    stop_reason: StopReason,
    index: &RetrievalIndex,
) -> GuardOutcome {
    let mut outcome = GuardOutcome::default();

    // citation_presence
    let present = !attempt.citations.is_empty();
    if !present {
        outcome.caps.groundedness = outcome.caps.groundedness.min(3.0);
        outcome.validity_blocked_reasons.push("missing_citations".to_string());
    }
    outcome.checks.push(DeterministicCheckResult {
        task_execution_id: exec_id.to_string(),
        name: "citation_presence".to_string(),
        passed: present,
        score_delta: if present { 0.0 } else { -2.0 },
        details: Some(json!({"citationCount": attempt.citations.len()})),
    });

    // citation_integrity: vacuously true with zero citations; presence above
    // already covers that case
    let bad_citations: Vec<String> = attempt
        .citations
        .iter()
        .filter(|c| {
            c.source.is_empty()
                || c.source == "unknown"
                || c.snippet_hash.is_empty()
                || c.excerpt.is_empty()
                || !index.contains(&c.source, &c.snippet_hash)
        })
        .map(|c| format!("{}#{}", c.source, c.snippet_hash))
        .collect();
    let intact = bad_citations.is_empty();
    if !intact {
        outcome.caps.groundedness = outcome.caps.groundedness.min(3.0);
        outcome.validity_blocked_reasons.push("invalid_citations".to_string());
    }
    outcome.checks.push(DeterministicCheckResult {
        task_execution_id: exec_id.to_string(),
        name: "citation_integrity".to_string(),
        passed: intact,
        score_delta: if intact { 0.0 } else { -2.0 },
        details: Some(json!({"invalid": bad_citations})),
    });

    // expected_signal_coverage
    let combined = format!("{}\n{}", attempt.answer, attempt.steps.join("\n"));
    let coverage = signal_coverage(&combined, &task.expected_signals);
    let covered = coverage >= SIGNAL_COVERAGE_THRESHOLD;
    if !covered {
        outcome.caps.completeness = outcome.caps.completeness.min(6.0);
    }
    outcome.checks.push(DeterministicCheckResult {
        task_execution_id: exec_id.to_string(),
        name: "expected_signal_coverage".to_string(),
        passed: covered,
        score_delta: if covered { 0.0 } else { -1.0 },
        details: Some(json!({
            "coverage": coverage,
            "signalCount": task.expected_signals.len(),
        })),
    });

    // actionable_step_depth
    let deep_enough = attempt.steps.len() >= 2 && step_count >= 2;
    if !deep_enough {
        outcome.caps.actionability = outcome.caps.actionability.min(6.0);
    }
    outcome.checks.push(DeterministicCheckResult {
        task_execution_id: exec_id.to_string(),
        name: "actionable_step_depth".to_string(),
        passed: deep_enough,
        score_delta: if deep_enough { 0.0 } else { -1.0 },
        details: Some(json!({
            "answerSteps": attempt.steps.len(),
            "iterations": step_count,
        })),
    });

    // bounded_termination
    let terminated_clean = stop_reason == StopReason::Completed;
    if !terminated_clean {
        outcome.caps.correctness = outcome.caps.correctness.min(8.0);
    }
    outcome.checks.push(DeterministicCheckResult {
        task_execution_id: exec_id.to_string(),
        name: "bounded_termination".to_string(),
        passed: terminated_clean,
        score_delta: if terminated_clean { 0.0 } else { -0.5 },
        details: Some(json!({"stopReason": stop_reason.to_string()})),
    });

    debug!(
        %exec_id,
        blocked = ?outcome.validity_blocked_reasons,
        "deterministic checks complete"
    );
    outcome
}
