//! TaskExecution and agent memory domain types
//!
//! One TaskExecution exists per (task, phase, worker). The execution carries
//! progress counters and a terminal status; exactly one AgentMemoryState row
//! shadows it, upserted by the single worker that owns the execution.

use serde::{Deserialize, Serialize};

use crate::id::generate_id;
use crate::time::now_ms;

/// Which pass of the run an execution belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvalPhase {
    #[default]
    Baseline,
    Optimized,
}

impl EvalPhase {
    pub fn parse(s: &str) -> Option<EvalPhase> {
        match s {
            "baseline" => Some(Self::Baseline),
            "optimized" => Some(Self::Optimized),
            _ => None,
        }
    }
}

impl std::fmt::Display for EvalPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Optimized => write!(f, "optimized"),
        }
    }
}

/// Why an execution stopped iterating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent declared the task done
    Completed,
    /// Loop exhausted its iteration budget
    StepLimit,
    /// Per-task token budget exhausted
    TokenLimit,
    /// Run-level cost cap reached; the execution is skipped, not judged
    CostLimit,
    /// Run cancellation observed at a loop boundary
    Cancelled,
    /// The agent or a model call gave up
    Error,
}

impl StopReason {
    pub fn parse(s: &str) -> Option<StopReason> {
        match s {
            "completed" => Some(Self::Completed),
            "step_limit" => Some(Self::StepLimit),
            "token_limit" => Some(Self::TokenLimit),
            "cost_limit" => Some(Self::CostLimit),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::StepLimit => "step_limit",
            Self::TokenLimit => "token_limit",
            Self::CostLimit => "cost_limit",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Execution status; terminal states mirror the owning task's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn parse(s: &str) -> Option<ExecutionStatus> {
        match s {
            "running" => Some(Self::Running),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Token and cost movement from one model call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_estimate: f64,
    pub latency_ms: u64,
}

impl CallUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One attempt of a task by a worker within a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub phase: EvalPhase,
    pub status: ExecutionStatus,
    pub step_count: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_estimate: f64,
    pub stop_reason: Option<StopReason>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

impl TaskExecution {
    pub fn new(run_id: &str, task_id: &str, worker_id: &str, phase: EvalPhase) -> Self {
        Self {
            id: generate_id("exec", task_id),
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            phase,
            status: ExecutionStatus::Running,
            step_count: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost_estimate: 0.0,
            stop_reason: None,
            started_at: now_ms(),
            ended_at: None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// One plan entry carried across iterations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    pub item: String,
    pub done: bool,
}

/// What the agent still has to spend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemainingBudget {
    pub steps: u32,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Self-referential working memory, one row per execution
///
/// All list fields deduplicate on update; facts and summaries keep a bounded
/// tail so the memory block stays prompt-sized.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentMemoryState {
    pub current_step: u32,
    pub goal: String,
    pub plan: Vec<PlanItem>,
    pub visited_sources: Vec<String>,
    pub facts: Vec<String>,
    pub step_summaries: Vec<String>,
    pub remaining_budget: RemainingBudget,
}

const MAX_FACTS: usize = 20;
const MAX_STEP_SUMMARIES: usize = 12;

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

impl AgentMemoryState {
    pub fn for_goal(goal: impl Into<String>, remaining: RemainingBudget) -> Self {
        Self {
            goal: goal.into(),
            remaining_budget: remaining,
            ..Default::default()
        }
    }

    /// Replace the plan with the union of plan items and updates, all marked
    /// not-done, preserving first-seen order and dropping duplicates.
    pub fn absorb_plan(&mut self, items: &[String], updates: &[String]) {
        let mut merged: Vec<PlanItem> = Vec::new();
        for item in items.iter().chain(updates.iter()) {
            let trimmed = item.trim();
            if trimmed.is_empty() || merged.iter().any(|p| p.item == trimmed) {
                continue;
            }
            merged.push(PlanItem {
                item: trimmed.to_string(),
                done: false,
            });
        }
        self.plan = merged;
    }

    /// Record retrieved chunk identities as "{sourceUrl}#{snippetHash}"
    pub fn absorb_sources<'a>(&mut self, refs: impl Iterator<Item = (&'a str, &'a str)>) {
        for (source_url, snippet_hash) in refs {
            push_unique(
                &mut self.visited_sources,
                format!("{}#{}", source_url, snippet_hash),
            );
        }
    }

    /// Append new facts, dedup, keep the last MAX_FACTS
    pub fn absorb_facts(&mut self, facts: &[String]) {
        for fact in facts {
            push_unique(&mut self.facts, fact.trim().to_string());
        }
        if self.facts.len() > MAX_FACTS {
            self.facts.drain(..self.facts.len() - MAX_FACTS);
        }
    }

    /// Append a step summary, keep the last MAX_STEP_SUMMARIES
    pub fn absorb_summary(&mut self, summary: &str) {
        if !summary.trim().is_empty() {
            self.step_summaries.push(summary.trim().to_string());
        }
        if self.step_summaries.len() > MAX_STEP_SUMMARIES {
            self.step_summaries
                .drain(..self.step_summaries.len() - MAX_STEP_SUMMARIES);
        }
    }

    /// Plan items not yet marked done
    pub fn pending_plan_items(&self) -> Vec<&str> {
        self.plan
            .iter()
            .filter(|p| !p.done)
            .map(|p| p.item.as_str())
            .collect()
    }

    pub fn last_summaries(&self, n: usize) -> Vec<&str> {
        let start = self.step_summaries.len().saturating_sub(n);
        self.step_summaries[start..].iter().map(|s| s.as_str()).collect()
    }

    pub fn last_facts(&self, n: usize) -> Vec<&str> {
        let start = self.facts.len().saturating_sub(n);
        self.facts[start..].iter().map(|s| s.as_str()).collect()
    }
}
