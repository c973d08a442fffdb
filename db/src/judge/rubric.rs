//! Rubric judge
//!
//! Two model calls per attempt: an evidence-alignment pass, then a rubric
//! pass scored on four criteria. Guardrails and deterministic caps clamp the
//! raw scores before the pass rule runs; a borderline average triggers an
//! optional second rubric pass whose scores are averaged in.

use std::sync::Arc;

use docmodel::{
    CriterionScores, EvalPhase, FailureClass, StopReason, Task, TaskEvaluation,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::Attempt;
use super::guard::GuardOutcome;
use crate::llm::{ChatMessage, ModelCallConfig, ModelClient, ModelUsage, complete_json, schema_of};
use crate::prompts;
use crate::prompts::PromptRegistry;
use crate::retrieval::RankedChunk;

/// Maximum chunks in the judge's evidence block
pub const EVIDENCE_CHUNKS: usize = 12;

const QUALITY_THRESHOLD: f64 = 7.0;
const TIE_BREAK_BAND: (f64, f64) = (6.5, 7.5);

/// Alignment call result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentOutput {
    pub is_supported_by_evidence: bool,
    #[serde(default)]
    pub unsupported_claims: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

/// Raw criterion scores from a rubric call
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RubricScores {
    pub completeness: f64,
    pub correctness: f64,
    pub groundedness: f64,
    pub actionability: f64,
}

/// Rubric call result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RubricOutput {
    pub scores: RubricScores,
    pub rationale: String,
    pub confidence: f64,
    #[serde(default)]
    pub suggested_failure_class: Option<String>,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Clamp raw scores, apply guardrails and deterministic caps, recompute mean
fn process_scores(
    raw: &RubricScores,
    attempt: &Attempt,
    alignment: &AlignmentOutput,
    guard: &GuardOutcome,
) -> CriterionScores {
    let mut scores = CriterionScores {
        completeness: raw.completeness,
        correctness: raw.correctness,
        groundedness: raw.groundedness,
        actionability: raw.actionability,
        average: 0.0,
    };
    scores.clamp_all();

    if attempt.citations.is_empty() {
        scores.groundedness = scores.groundedness.min(4.0);
    }
    if attempt.steps.len() < 2 {
        scores.actionability = scores.actionability.min(6.0);
    }
    if !alignment.unsupported_claims.is_empty() {
        scores.correctness = scores.correctness.min(6.0);
        scores.groundedness = scores.groundedness.min(5.0);
    }

    guard.caps.apply(&mut scores);
    scores.recompute_average();
    scores
}

/// Pick the failure class for a non-passing evaluation
pub fn classify_failure(
    suggested: Option<&str>,
    rationale: &str,
    scores: &CriterionScores,
) -> FailureClass {
    if let Some(suggested) = suggested
        && let Some(class) = FailureClass::parse(suggested.trim())
    {
        return class;
    }
    let rationale = rationale.to_lowercase();
    if rationale.contains("outdated") || rationale.contains("deprecated") {
        return FailureClass::OutdatedContent;
    }
    if rationale.contains("broken link") || rationale.contains("404") {
        return FailureClass::BrokenLinks;
    }
    if rationale.contains("no example") || rationale.contains("missing example") {
        return FailureClass::MissingExamples;
    }
    if rationale.contains("ambiguous") || rationale.contains("unclear") {
        return FailureClass::AmbiguousInstructions;
    }
    if scores.groundedness < 5.0 {
        FailureClass::MissingContent
    } else if scores.actionability < 6.0 && scores.completeness < 6.0 {
        FailureClass::InsufficientDetail
    } else {
        FailureClass::PoorStructure
    }
}

/// Everything one evaluation needs
pub struct JudgeRequest<'a> {
    pub run_id: &'a str,
    pub task: &'a Task,
    pub attempt: &'a Attempt,
    pub guard: &'a GuardOutcome,
    pub evidence: &'a [RankedChunk],
    pub stop_reason: StopReason,
    pub phase: EvalPhase,
    pub tie_break_enabled: bool,
}

/// LLM-backed two-pass evaluator
pub struct RubricJudge {
    model: Arc<dyn ModelClient>,
    prompts: Arc<PromptRegistry>,
    call_config: ModelCallConfig,
}

impl RubricJudge {
    pub fn new(model: Arc<dyn ModelClient>, prompts: Arc<PromptRegistry>, call_config: ModelCallConfig) -> Self {
        Self {
            model,
            prompts,
            call_config,
        }
    }

    /// Evaluate one attempt. Returns the verdict and the usage consumed by
    /// all judge calls, for cost attribution to the execution.
    pub async fn evaluate(&self, request: JudgeRequest<'_>) -> eyre::Result<(TaskEvaluation, ModelUsage)> {
        let mut usage = ModelUsage::default();
        let evidence: Vec<&RankedChunk> = request.evidence.iter().take(EVIDENCE_CHUNKS).collect();

        let alignment = self.alignment_call(&request, &evidence, &mut usage).await?;
        let first = self.rubric_call(&request, &alignment, &mut usage).await?;
        let mut scores = process_scores(&first.parsed.scores, request.attempt, &alignment.parsed, request.guard);
        let mut rationale = first.parsed.rationale.clone();
        let mut confidence = first.parsed.confidence.clamp(0.0, 1.0);
        let mut suggested = first.parsed.suggested_failure_class.clone();
        let judge_model = first.model.clone();

        if request.tie_break_enabled
            && scores.average >= TIE_BREAK_BAND.0
            && scores.average <= TIE_BREAK_BAND.1
        {
            debug!(average = scores.average, "tie-break: re-running rubric");
            let second = self.rubric_call(&request, &alignment, &mut usage).await?;
            let second_scores =
                process_scores(&second.parsed.scores, request.attempt, &alignment.parsed, request.guard);
            scores = CriterionScores::with_average(
                round2((scores.completeness + second_scores.completeness) / 2.0),
                round2((scores.correctness + second_scores.correctness) / 2.0),
                round2((scores.groundedness + second_scores.groundedness) / 2.0),
                round2((scores.actionability + second_scores.actionability) / 2.0),
            );
            confidence = round2((confidence + second.parsed.confidence.clamp(0.0, 1.0)) / 2.0);
            if suggested.is_none() {
                suggested = second.parsed.suggested_failure_class.clone();
            }
            rationale = second.parsed.rationale;
        }

        let quality_pass = scores.average >= QUALITY_THRESHOLD;
        let validity_pass = alignment.parsed.is_supported_by_evidence && !request.guard.blocked();
        let pass = quality_pass && validity_pass;
        let failure_class = if pass {
            None
        } else {
            Some(classify_failure(suggested.as_deref(), &rationale, &scores))
        };

        info!(
            task_id = %request.task.task_id,
            phase = %request.phase,
            average = scores.average,
            pass,
            quality_pass,
            validity_pass,
            "attempt judged"
        );

        Ok((
            TaskEvaluation {
                run_id: request.run_id.to_string(),
                task_id: request.task.task_id.clone(),
                phase: request.phase,
                criterion_scores: scores,
                pass,
                quality_pass,
                validity_pass,
                validity_blocked_reasons: request.guard.validity_blocked_reasons.clone(),
                failure_class,
                rationale,
                judge_model,
                confidence,
            },
            usage,
        ))
    }

    async fn alignment_call(
        &self,
        request: &JudgeRequest<'_>,
        evidence: &[&RankedChunk],
        usage: &mut ModelUsage,
    ) -> eyre::Result<crate::llm::JsonCompletion<AlignmentOutput>> {
        let schema = schema_of::<AlignmentOutput>();
        let user = self.prompts.render(
            "alignment",
            &json!({
                "task_name": request.task.name,
                "answer": request.attempt.answer,
                "steps": request.attempt.steps,
                "citations": request.attempt.citations.iter().map(|c| json!({
                    "source": c.source,
                    "snippet_hash": c.snippet_hash,
                    "excerpt": c.excerpt,
                })).collect::<Vec<_>>(),
                "chunks": evidence.iter().map(|c| json!({
                    "source_url": c.source_url,
                    "snippet_hash": c.snippet_hash,
                    "text": c.text,
                })).collect::<Vec<_>>(),
                "schema": schema,
            }),
        )?;
        let completion = complete_json::<AlignmentOutput>(
            self.model.as_ref(),
            &self.call_config,
            vec![
                ChatMessage::system(prompts::ALIGNMENT_SYSTEM),
                ChatMessage::user(user),
            ],
            &schema,
        )
        .await?;
        usage.absorb(&completion.usage);
        Ok(completion)
    }

    async fn rubric_call(
        &self,
        request: &JudgeRequest<'_>,
        alignment: &crate::llm::JsonCompletion<AlignmentOutput>,
        usage: &mut ModelUsage,
    ) -> eyre::Result<crate::llm::JsonCompletion<RubricOutput>> {
        let schema = schema_of::<RubricOutput>();
        let user = self.prompts.render(
            "rubric",
            &json!({
                "task_name": request.task.name,
                "task_description": request.task.description,
                "expected_signals": request.task.expected_signals,
                "answer": request.attempt.answer,
                "steps": request.attempt.steps,
                "citation_count": request.attempt.citations.len(),
                "stop_reason": request.stop_reason.to_string(),
                "is_supported": alignment.parsed.is_supported_by_evidence,
                "unsupported_claims": alignment.parsed.unsupported_claims,
                "failure_classes": FailureClass::ALL.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
                "schema": schema,
            }),
        )?;
        let completion = complete_json::<RubricOutput>(
            self.model.as_ref(),
            &self.call_config,
            vec![
                ChatMessage::system(prompts::RUBRIC_SYSTEM),
                ChatMessage::user(user),
            ],
            &schema,
        )
        .await?;
        usage.absorb(&completion.usage);
        Ok(completion)
    }
}
