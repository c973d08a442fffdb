//! Two-stage evaluation pipeline
//!
//! Deterministic guards run first and can block a pass outright; the rubric
//! judge then scores the attempt under the guard's caps.

pub mod guard;
pub mod rubric;

use docmodel::{CriterionScores, EvalPhase, FailureClass, StepCitation, TaskEvaluation};

pub use guard::{GuardOutcome, ScoreCaps, SIGNAL_COVERAGE_THRESHOLD, normalize, run_checks, signal_coverage};
pub use rubric::{
    AlignmentOutput, EVIDENCE_CHUNKS, JudgeRequest, RubricJudge, RubricOutput, RubricScores,
    classify_failure,
};

/// What a finished execution hands to the evaluator
#[derive(Debug, Clone, Default)]
pub struct Attempt {
    /// Final answer text
    pub answer: String,
    /// Actionable steps accumulated across iterations
    pub steps: Vec<String>,
    /// Deduplicated citations accumulated across iterations
    pub citations: Vec<StepCitation>,
}

/// The evaluation written when an execution errors before it can be judged
pub fn fallback_evaluation(
    run_id: &str,
    task_id: &str,
    phase: EvalPhase,
    judge_model: &str,
    detail: &str,
) -> TaskEvaluation {
    TaskEvaluation {
        run_id: run_id.to_string(),
        task_id: task_id.to_string(),
        phase,
        criterion_scores: CriterionScores::default(),
        pass: false,
        quality_pass: false,
        validity_pass: false,
        validity_blocked_reasons: vec!["execution_error".to_string()],
        failure_class: Some(FailureClass::PoorStructure),
        rationale: format!("task execution failed before evaluation: {}", detail),
        judge_model: judge_model.to_string(),
        confidence: 0.0,
    }
}
