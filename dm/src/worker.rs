//! Worker domain type
//!
//! Workers are the model-backed agents a run provisions from its assignment
//! table. Labels are unique within a run.

use serde::{Deserialize, Serialize};

use crate::id::generate_id;

/// Worker activity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    pub fn parse(s: &str) -> Option<WorkerStatus> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Per-worker model parameter overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One row of the worker assignment table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAssignment {
    pub provider: String,
    pub model: String,
    pub quantity: usize,
    #[serde(default)]
    pub overrides: ModelOverrides,
}

impl Default for WorkerAssignment {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            quantity: 1,
            overrides: ModelOverrides::default(),
        }
    }
}

/// A provisioned worker within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub run_id: String,
    /// Unique within the run, e.g. "w01-gpt-4o-mini"
    pub worker_label: String,
    pub model_provider: String,
    pub model_name: String,
    pub model_config: ModelOverrides,
    pub status: WorkerStatus,
}

impl Worker {
    pub fn provision(run_id: &str, label: &str, assignment: &WorkerAssignment) -> Self {
        Self {
            id: generate_id("worker", label),
            run_id: run_id.to_string(),
            worker_label: label.to_string(),
            model_provider: assignment.provider.clone(),
            model_name: assignment.model.clone(),
            model_config: assignment.overrides.clone(),
            status: WorkerStatus::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_copies_assignment() {
        let assignment = WorkerAssignment {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            quantity: 2,
            overrides: ModelOverrides {
                temperature: Some(0.2),
                ..Default::default()
            },
        };
        let worker = Worker::provision("run-1", "w01-gpt-4o", &assignment);
        assert_eq!(worker.model_name, "gpt-4o");
        assert_eq!(worker.model_config.temperature, Some(0.2));
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[test]
    fn test_worker_status_terminal() {
        assert!(WorkerStatus::Done.is_terminal());
        assert!(WorkerStatus::Error.is_terminal());
        assert!(!WorkerStatus::Idle.is_terminal());
        assert!(!WorkerStatus::Running.is_terminal());
    }
}
