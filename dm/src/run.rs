//! Run domain type
//!
//! A run owns everything else: its config, its tasks, its workers, its
//! executions and evaluations, and the event stream observers follow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::id::generate_id;
use crate::task::TaskSpec;
use crate::time::now_ms;
use crate::worker::WorkerAssignment;

/// Run lifecycle status
///
/// Statuses form a DAG: queued, ingesting, generating_tasks, running,
/// evaluating, then one of the terminal three. Terminal statuses are sticky;
/// only the finalizer may rewrite one terminal status with another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Ingesting,
    GeneratingTasks,
    Running,
    Evaluating,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Terminal statuses accept no further lifecycle transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// The next non-terminal stage in the lifecycle chain
    fn successor(&self) -> Option<RunStatus> {
        match self {
            Self::Queued => Some(Self::Ingesting),
            Self::Ingesting => Some(Self::GeneratingTasks),
            Self::GeneratingTasks => Some(Self::Running),
            Self::Running => Some(Self::Evaluating),
            Self::Evaluating => None,
            _ => None,
        }
    }

    /// Whether a non-finalizer transition from `self` to `next` is allowed.
    ///
    /// Terminal states reject everything here; a terminal-to-terminal rewrite
    /// goes through the finalizer only. Any non-terminal state may jump to a
    /// terminal state (failure and cancellation can strike at any stage).
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        self.successor() == Some(next)
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "queued" => Some(Self::Queued),
            "ingesting" => Some(Self::Ingesting),
            "generating_tasks" => Some(Self::GeneratingTasks),
            "running" => Some(Self::Running),
            "evaluating" => Some(Self::Evaluating),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Ingesting => "ingesting",
            Self::GeneratingTasks => "generating_tasks",
            Self::Running => "running",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// Immutable per-run configuration, fixed at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Maximum number of tasks synthesized for the run
    pub max_tasks: usize,

    /// Maximum loop iterations per task execution
    pub max_steps_per_task: u32,

    /// Maximum tokens (in + out) one task execution may consume
    pub max_tokens_per_task: u64,

    /// Hard cost ceiling for the whole run, in USD
    pub hard_cost_cap_usd: f64,

    /// Concurrent worker activities
    pub execution_concurrency: usize,

    /// Concurrent judge calls across the pool
    pub judge_concurrency: usize,

    /// Re-run the rubric when the average lands in the gray band
    pub tie_break_enabled: bool,

    /// Run the optimized second phase when baseline failures exist
    pub enable_skill_optimization: bool,

    /// Model used by worker agents
    pub run_model: String,

    /// Model used by the rubric judge
    pub judge_model: String,

    /// Per-model-call timeout in milliseconds
    pub timeout_ms: u64,

    /// Transient-error retries per model call
    pub retries: u32,

    /// Worker provisioning table; quantities sum to the worker count
    pub workers: Vec<WorkerAssignment>,

    /// User-defined tasks merged into the synthesized set
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl RunConfig {
    /// Total worker count across all assignments
    pub fn worker_count(&self) -> usize {
        self.workers.iter().map(|a| a.quantity).sum()
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_tasks: 6,
            max_steps_per_task: 6,
            max_tokens_per_task: 60_000,
            hard_cost_cap_usd: 2.0,
            execution_concurrency: 2,
            judge_concurrency: 2,
            tie_break_enabled: true,
            enable_skill_optimization: false,
            run_model: "gpt-4o-mini".to_string(),
            judge_model: "gpt-4o-mini".to_string(),
            timeout_ms: 120_000,
            retries: 2,
            workers: vec![WorkerAssignment::default()],
            tasks: Vec::new(),
        }
    }
}

/// Aggregated results for one phase of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub total_tasks: usize,
    pub passed_tasks: usize,
    pub failed_tasks: usize,
    pub pass_rate: f64,
    pub quality_passed_tasks: usize,
    pub quality_pass_rate: f64,
    pub validity_passed_tasks: usize,
    pub validity_pass_rate: f64,
    pub average_score: f64,
    /// Counts grouped by failure class, nulls excluded
    pub failure_breakdown: BTreeMap<String, usize>,
}

/// Component-wise optimized-minus-baseline movement, rounded to 4 decimals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsDelta {
    pub pass_rate_delta: f64,
    pub average_score_delta: f64,
    pub passed_tasks_delta: i64,
    pub failed_tasks_delta: i64,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

impl TotalsDelta {
    /// Optimized minus baseline, component-wise
    pub fn between(baseline: &RunTotals, optimized: &RunTotals) -> Self {
        Self {
            pass_rate_delta: round4(optimized.pass_rate - baseline.pass_rate),
            average_score_delta: round4(optimized.average_score - baseline.average_score),
            passed_tasks_delta: optimized.passed_tasks as i64 - baseline.passed_tasks as i64,
            failed_tasks_delta: optimized.failed_tasks as i64 - baseline.failed_tasks as i64,
        }
    }
}

/// One evaluation run over a documentation corpus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,

    /// Base URL (or local path) of the documentation corpus
    pub docs_url: String,

    pub status: RunStatus,

    /// Creation timestamp (Unix milliseconds)
    pub started_at: i64,

    /// Set by the finalizer
    pub ended_at: Option<i64>,

    pub config: RunConfig,

    /// Authoritative totals, written by the finalizer
    pub totals: Option<RunTotals>,

    /// Monotonically non-decreasing accumulated cost in USD
    pub cost_estimate: f64,
}

impl Run {
    pub fn new(docs_url: impl Into<String>, config: RunConfig) -> Self {
        let docs_url = docs_url.into();
        debug!(%docs_url, "Run::new");
        Self {
            id: generate_id("run", &docs_url),
            docs_url,
            status: RunStatus::Queued,
            started_at: now_ms(),
            ended_at: None,
            config,
            totals: None,
            cost_estimate: 0.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
