//! Optimized-skill generation
//!
//! After a baseline phase with failures, one schema-constrained model call
//! regenerates the site's agent skill document from the failure evidence.
//! The optimized phase then runs against an artifact set where the site
//! skill (if any) is replaced by the generated one.

use docmodel::{Artifact, ArtifactType, Run, TaskEvaluation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::context::{Services, judge_call_config};
use crate::llm::{ChatMessage, ModelUsage, complete_json, schema_of};
use crate::prompts;
use crate::retrieval::sha256_hex;

/// Sections a well-formed skill document must carry
pub const REQUIRED_SECTIONS: [&str; 5] = [
    "# Purpose",
    "# Retrieval Strategy",
    "# Critical Workflows",
    "# Failure Prevention",
    "# Verification Checklist",
];

/// Skill generation call result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SkillOutput {
    pub optimized_skill_markdown: String,
    #[serde(default)]
    pub optimization_notes: Vec<String>,
}

/// A generated skill plus the usage it cost
#[derive(Debug, Clone)]
pub struct GeneratedSkill {
    pub markdown: String,
    pub notes: Vec<String>,
    pub usage: ModelUsage,
}

/// Generate the optimized skill from baseline failures
pub async fn generate_optimized_skill(
    services: &Services,
    run: &Run,
    site_skill: Option<&str>,
    failures: &[TaskEvaluation],
) -> eyre::Result<GeneratedSkill> {
    let schema = schema_of::<SkillOutput>();
    let user = services.prompts.render(
        "skill",
        &json!({
            "docs_url": run.docs_url,
            "site_skill": site_skill,
            "failures": failures.iter().map(|f| json!({
                "task_id": f.task_id,
                "failure_class": f.failure_class.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()),
                "scores": format!(
                    "completeness={:.1} correctness={:.1} groundedness={:.1} actionability={:.1}",
                    f.criterion_scores.completeness,
                    f.criterion_scores.correctness,
                    f.criterion_scores.groundedness,
                    f.criterion_scores.actionability,
                ),
                "rationale": f.rationale,
            })).collect::<Vec<_>>(),
            "schema": schema,
        }),
    )?;

    let completion = complete_json::<SkillOutput>(
        services.model.as_ref(),
        &judge_call_config(&run.config),
        vec![ChatMessage::system(prompts::SKILL_SYSTEM), ChatMessage::user(user)],
        &schema,
    )
    .await?;

    let markdown = completion.parsed.optimized_skill_markdown;
    for section in REQUIRED_SECTIONS {
        if !markdown.contains(section) {
            warn!(section, "generated skill is missing a required section");
        }
    }
    debug!(
        chars = markdown.len(),
        notes = completion.parsed.optimization_notes.len(),
        "skill generated"
    );
    Ok(GeneratedSkill {
        markdown,
        notes: completion.parsed.optimization_notes,
        usage: completion.usage,
    })
}

/// The persisted record of a generated skill, keyed by its content hash
pub fn optimized_skill_artifact(markdown: &str) -> Artifact {
    let content_hash = sha256_hex(markdown);
    Artifact {
        artifact_type: ArtifactType::OptimizedSkill,
        source_url: format!("docbench://skills/{}", &content_hash[..16]),
        content: markdown.to_string(),
        content_hash,
        metadata: None,
    }
}

/// Re-derive the artifact set for the optimized phase: drop any skill-typed
/// artifact, append one synthetic skill artifact with the generated content
pub fn substitute_skill(artifacts: &[Artifact], markdown: &str, docs_url: &str) -> Vec<Artifact> {
    let mut derived: Vec<Artifact> = artifacts
        .iter()
        .filter(|a| a.artifact_type != ArtifactType::Skill)
        .cloned()
        .collect();
    derived.push(Artifact {
        artifact_type: ArtifactType::Skill,
        source_url: format!("{}/skill.md", docs_url.trim_end_matches('/')),
        content: markdown.to_string(),
        content_hash: sha256_hex(markdown),
        metadata: Some(json!({"generated": true})),
    });
    derived
}
