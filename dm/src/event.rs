//! Run event domain type
//!
//! Events are append-only per run. `seq` is dense and unique within a run;
//! the global insertion `id` is the reader cursor because it totally orders
//! delivered events even when writers race on `seq`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dot-notation event type constants
pub mod event_types {
    pub const RUN_CREATED: &str = "run.created";
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_STATUS_CHANGED: &str = "run.status.changed";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_CANCELED: &str = "run.canceled";
    pub const RUN_ERROR: &str = "run.error";

    pub const PHASE_STARTED: &str = "phase.started";
    pub const PHASE_COMPLETED: &str = "phase.completed";

    pub const INGESTION_COMPLETED: &str = "ingestion.completed";
    pub const TASKS_GENERATED: &str = "tasks.generated";

    pub const WORKER_STARTED: &str = "worker.started";
    pub const WORKER_STOPPED: &str = "worker.stopped";

    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_STEP_CREATED: &str = "task.step.created";
    pub const TASK_EXECUTION_COMPLETED: &str = "task.execution.completed";
    pub const TASK_SKIPPED: &str = "task.skipped";
    pub const TASK_ERROR: &str = "task.error";

    pub const SKILL_GENERATION_STARTED: &str = "skill.generation.started";
    pub const SKILL_GENERATED: &str = "skill.generated";
    pub const SKILL_GENERATION_FAILED: &str = "skill.generation.failed";

    /// Types whose arrival signals the end of a run's event stream
    pub const TERMINAL: [&str; 3] = [RUN_COMPLETED, RUN_FAILED, RUN_CANCELED];

    pub fn is_terminal(event_type: &str) -> bool {
        TERMINAL.contains(&event_type)
    }
}

/// Structured event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl EventPayload {
    pub fn new(run_id: &str, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// One appended event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// Dense global insertion id; the reader cursor
    pub id: i64,
    pub run_id: String,
    /// Dense per-run sequence, unique within the run
    pub seq: i64,
    pub event_type: String,
    pub payload: EventPayload,
    pub created_at: i64,
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        event_types::is_terminal(&self.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_types() {
        assert!(event_types::is_terminal("run.completed"));
        assert!(event_types::is_terminal("run.failed"));
        assert!(event_types::is_terminal("run.canceled"));
        assert!(!event_types::is_terminal("task.step.created"));
    }

    #[test]
    fn test_payload_builder() {
        let payload = EventPayload::new("run-1", "step persisted")
            .with_phase("baseline")
            .with_data(json!({"stepIndex": 2}));
        assert_eq!(payload.phase.as_deref(), Some("baseline"));
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("runId"));
        assert!(json.contains("stepIndex"));
    }

    #[test]
    fn test_event_is_terminal() {
        let event = RunEvent {
            id: 1,
            run_id: "run-1".into(),
            seq: 1,
            event_type: event_types::RUN_CANCELED.into(),
            payload: EventPayload::new("run-1", "canceled"),
            created_at: 0,
        };
        assert!(event.is_terminal());
    }
}
