//! Prompt registry
//!
//! Handlebars templates for every model call the orchestrator makes. Each
//! call has a static system prompt and a rendered user prompt; the user
//! prompt embeds the JSON Schema the response must satisfy.

use handlebars::Handlebars;
use serde_json::Value;

pub const PLAN_SYSTEM: &str = "You are the planning module of a documentation-following agent. \
You break a documentation task into concrete, checkable plan items grounded in what the \
documentation actually covers. Respond with JSON only.";

const PLAN_USER: &str = r#"## Planning request

Task: {{task_name}}
{{task_description}}

Expected signals the final answer should cover:
{{#each expected_signals}}- {{this}}
{{/each}}

Plan items still open:
{{#each pending_plan}}- {{this}}
{{/each}}

Recent step summaries:
{{#each summaries}}- {{this}}
{{/each}}

Known facts:
{{#each facts}}- {{this}}
{{/each}}

This is iteration {{step_index}} with {{remaining_steps}} iterations left.
Revise the plan for the next action. Respond with JSON matching this schema:
{{{schema}}}"#;

pub const ACT_SYSTEM: &str = "You are the acting module of a documentation-following agent. \
You answer implementation tasks using ONLY the documentation evidence provided in the \
request. Every claim must be cited with the source and snippetHash of the chunk that \
supports it. If the evidence is insufficient, say so in stepOutput and keep done false. \
Respond with JSON only.";

const ACT_USER: &str = r#"## Action request

Task: {{task_name}}
{{task_description}}

Current plan:
{{#each pending_plan}}- {{this}}
{{/each}}

Documentation evidence:
{{#each chunks}}[source: {{source_url}} | snippetHash: {{snippet_hash}}]
{{{text}}}

{{/each}}

Produce the best complete answer you can right now, as numbered actionable steps,
with citations into the evidence above. Respond with JSON matching this schema:
{{{schema}}}"#;

pub const REFLECT_SYSTEM: &str = "You are the reflection module of a documentation-following \
agent. You judge whether the current answer is complete enough to stop, summarize what the \
iteration learned, and propose plan updates. Respond with JSON only.";

const REFLECT_USER: &str = r#"## Reflection request

Task: {{task_name}}
Expected signals: {{#each expected_signals}}{{this}}; {{/each}}

Latest answer:
{{{answer}}}

Latest step output:
{{{step_output}}}

The acting module set done={{act_done}}{{#if done_reason}} ({{done_reason}}){{/if}}.
Citations provided: {{citation_count}}. {{remaining_steps}} iterations remain.

Decide whether to continue. Respond with JSON matching this schema:
{{{schema}}}"#;

pub const ALIGNMENT_SYSTEM: &str = "You verify whether a candidate answer is supported by the \
supplied documentation evidence. List any claims that the evidence does not support. \
Respond with JSON only.";

const ALIGNMENT_USER: &str = r#"## Evidence alignment request

Task: {{task_name}}

Candidate answer:
{{{answer}}}

Steps taken:
{{#each steps}}- {{this}}
{{/each}}

Citations:
{{#each citations}}- {{source}}#{{snippet_hash}}: {{excerpt}}
{{/each}}

Evidence block:
{{#each chunks}}[source: {{source_url}} | snippetHash: {{snippet_hash}}]
{{{text}}}

{{/each}}

Respond with JSON matching this schema:
{{{schema}}}"#;

pub const RUBRIC_SYSTEM: &str = "You are a strict documentation-task judge. Score the attempt \
on completeness, correctness, groundedness and actionability, each 0 to 10, and explain \
your scores briefly. Respond with JSON only.";

const RUBRIC_USER: &str = r#"## Rubric scoring request

Task: {{task_name}}
{{task_description}}
Expected signals: {{#each expected_signals}}{{this}}; {{/each}}

Attempt answer:
{{{answer}}}

Steps taken:
{{#each steps}}- {{this}}
{{/each}}

Citations provided: {{citation_count}}
Execution stop reason: {{stop_reason}}

Evidence alignment verdict: supported={{is_supported}}
Unsupported claims:
{{#each unsupported_claims}}- {{this}}
{{/each}}

Allowed failure classes: {{#each failure_classes}}{{this}}; {{/each}}

Respond with JSON matching this schema:
{{{schema}}}"#;

pub const SKILL_SYSTEM: &str = "You write agent skill documents for documentation sites. A \
skill document teaches retrieval-driven coding agents how to succeed against this site's \
documentation. Respond with JSON only.";

const SKILL_USER: &str = r#"## Skill regeneration request

Documentation site: {{docs_url}}

{{#if site_skill}}Existing site skill:
{{{site_skill}}}
{{else}}The site ships no skill document.
{{/if}}

Baseline failures to prevent:
{{#each failures}}- task {{task_id}}: {{failure_class}} (scores {{scores}})
  rationale: {{rationale}}
{{/each}}

Write a fully-formed replacement skill document in markdown. It must contain these
sections: # Purpose, # Retrieval Strategy, # Critical Workflows, # Failure Prevention,
# Verification Checklist. Mention every expected signal the failures missed.
Respond with JSON matching this schema:
{{{schema}}}"#;

/// Registered templates, built once and shared
pub struct PromptRegistry {
    hb: Handlebars<'static>,
}

impl PromptRegistry {
    pub fn new() -> eyre::Result<Self> {
        let mut hb = Handlebars::new();
        for (name, template) in [
            ("plan", PLAN_USER),
            ("act", ACT_USER),
            ("reflect", REFLECT_USER),
            ("alignment", ALIGNMENT_USER),
            ("rubric", RUBRIC_USER),
            ("skill", SKILL_USER),
        ] {
            hb.register_template_string(name, template)?;
        }
        Ok(Self { hb })
    }

    pub fn render(&self, name: &str, ctx: &Value) -> eyre::Result<String> {
        Ok(self.hb.render(name, ctx)?)
    }
}
