//! Task domain type
//!
//! A task is a documented workflow an agent must accomplish using only
//! retrieved context. Status is scoped within a run phase and resets when
//! the optimized phase begins.

use serde::{Deserialize, Serialize};

use crate::id::generate_id;

/// Per-phase task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Error | Self::Skipped)
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// A unit of work within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub run_id: String,
    pub name: String,
    pub description: String,
    /// Free-form grouping label ("template", "heading", "user", ...)
    pub category: String,
    /// "easy" | "medium" | "hard"
    pub difficulty: String,
    /// Phrases a complete answer is expected to mention
    pub expected_signals: Vec<String>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(run_id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            task_id: generate_id("task", &name),
            run_id: run_id.into(),
            name,
            description: String::new(),
            category: "template".to_string(),
            difficulty: "medium".to_string(),
            expected_signals: Vec::new(),
            status: TaskStatus::Pending,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_difficulty(mut self, difficulty: impl Into<String>) -> Self {
        self.difficulty = difficulty.into();
        self
    }

    pub fn with_signals(mut self, signals: Vec<String>) -> Self {
        self.expected_signals = signals;
        self
    }
}

/// User-supplied task definition accepted at run creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub expected_signals: Vec<String>,
}

impl TaskSpec {
    /// Materialize a user-defined task for a run
    pub fn into_task(self, run_id: &str) -> Task {
        Task::new(run_id, self.name)
            .with_description(self.description)
            .with_category(self.category.unwrap_or_else(|| "user".to_string()))
            .with_difficulty(self.difficulty.unwrap_or_else(|| "medium".to_string()))
            .with_signals(self.expected_signals)
    }
}
