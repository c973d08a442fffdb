//! Task synthesis
//!
//! A run's task list comes from three sources, in order: built-in template
//! tasks covering the workflows every documentation site should support,
//! tasks derived from artifact headings, and user-defined tasks from the run
//! request. The synthesized portion is capped so user tasks always survive
//! the task budget.

use docmodel::{Artifact, Run, Task};
use tracing::debug;

use crate::retrieval::tokenize;

struct TaskTemplate {
    name: &'static str,
    description: &'static str,
    difficulty: &'static str,
    signals: &'static [&'static str],
}

const TEMPLATES: &[TaskTemplate] = &[
    TaskTemplate {
        name: "Set up from scratch",
        description: "Starting from nothing, describe how to install the product and reach a \
                      first working call or build, exactly as the documentation prescribes.",
        difficulty: "easy",
        signals: &["install", "quickstart"],
    },
    TaskTemplate {
        name: "Authenticate requests",
        description: "Describe end to end how to authenticate requests: where credentials come \
                      from, how they are attached, and what an unauthenticated caller sees.",
        difficulty: "medium",
        signals: &["api key", "authorization"],
    },
    TaskTemplate {
        name: "Handle errors and retries",
        description: "Describe how the product reports failures and what a client should do \
                      about transient ones, using only documented behavior.",
        difficulty: "medium",
        signals: &["error", "retry"],
    },
    TaskTemplate {
        name: "Walk a core workflow",
        description: "Pick the product's central documented workflow and produce the concrete \
                      steps an agent would follow to complete it.",
        difficulty: "hard",
        signals: &["example", "request"],
    },
];

/// Derive expected signals from a heading: its first few meaningful tokens
fn heading_signals(heading: &str) -> Vec<String> {
    tokenize(heading)
        .into_iter()
        .filter(|t| t.len() >= 4)
        .take(3)
        .collect()
}

/// Scan markdown-ish artifacts for section headings worth turning into tasks
fn collect_headings(artifacts: &[Artifact]) -> Vec<String> {
    let mut headings = Vec::new();
    for artifact in artifacts {
        for line in artifact.content.lines() {
            let trimmed = line.trim();
            let Some(heading) = trimmed
                .strip_prefix("## ")
                .or_else(|| trimmed.strip_prefix("# "))
            else {
                continue;
            };
            let heading = heading.trim();
            if heading.len() < 4 || headings.iter().any(|h| h == heading) {
                continue;
            }
            headings.push(heading.to_string());
        }
    }
    headings
}

/// Build the run's task list from templates, headings and user definitions
pub fn synthesize_tasks(run: &Run, artifacts: &[Artifact]) -> Vec<Task> {
    let max_tasks = run.config.max_tasks.max(1);
    let user_tasks: Vec<Task> = run
        .config
        .tasks
        .iter()
        .cloned()
        .map(|spec| spec.into_task(&run.id))
        .collect();
    let synthesized_budget = max_tasks.saturating_sub(user_tasks.len());

    let mut tasks: Vec<Task> = Vec::new();
    for template in TEMPLATES {
        if tasks.len() >= synthesized_budget {
            break;
        }
        tasks.push(
            Task::new(&run.id, template.name)
                .with_description(template.description)
                .with_category("template")
                .with_difficulty(template.difficulty)
                .with_signals(template.signals.iter().map(|s| s.to_string()).collect()),
        );
    }

    for heading in collect_headings(artifacts) {
        if tasks.len() >= synthesized_budget {
            break;
        }
        let description = format!(
            "Using only the documentation, produce the concrete steps needed to accomplish \
             \"{}\" as that section describes.",
            heading
        );
        tasks.push(
            Task::new(&run.id, format!("Implement: {}", heading))
                .with_description(description)
                .with_category("heading")
                .with_difficulty("medium")
                .with_signals(heading_signals(&heading)),
        );
    }

    tasks.extend(user_tasks);
    tasks.truncate(max_tasks);
    debug!(run_id = %run.id, count = tasks.len(), "tasks synthesized");
    tasks
}
