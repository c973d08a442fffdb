//! Orchestrator entry
//!
//! Owns run creation and validation, the idempotent background start, the
//! outer error sink, cancellation, the observer snapshot, and the event
//! stream handle. Per-task errors never fail a run; anything that escapes
//! the phase executor does, through the RUN_FATAL path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use docmodel::{
    EventPayload, Run, RunConfig, RunStatus, SkillOptimizationSession, Task, TaskEvaluation,
    TaskSpec, Worker, WorkerAssignment, event_types,
};
use docstore::RunErrorRecord;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::context::Services;
use crate::events::EventStream;
use crate::ingest::Ingestor;
use crate::lifecycle;
use crate::phase;
use crate::taskgen;

/// Worker provisioning section of a run request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkersRequest {
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub assignments: Vec<WorkerAssignment>,
}

/// A user-submitted run request; unset fields fall back to defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub docs_url: String,
    #[serde(default)]
    pub task_count: Option<usize>,
    #[serde(default)]
    pub execution_concurrency: Option<usize>,
    #[serde(default)]
    pub judge_concurrency: Option<usize>,
    #[serde(default)]
    pub max_steps_per_task: Option<u32>,
    #[serde(default)]
    pub max_tokens_per_task: Option<u64>,
    #[serde(default)]
    pub hard_cost_cap_usd: Option<f64>,
    #[serde(default)]
    pub tie_break_enabled: Option<bool>,
    #[serde(default)]
    pub enable_skill_optimization: Option<bool>,
    #[serde(default)]
    pub run_model: Option<String>,
    #[serde(default)]
    pub judge_model: Option<String>,
    #[serde(default)]
    pub workers: Option<WorkersRequest>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl RunRequest {
    pub fn new(docs_url: impl Into<String>) -> Self {
        Self {
            docs_url: docs_url.into(),
            task_count: None,
            execution_concurrency: None,
            judge_concurrency: None,
            max_steps_per_task: None,
            max_tokens_per_task: None,
            hard_cost_cap_usd: None,
            tie_break_enabled: None,
            enable_skill_optimization: None,
            run_model: None,
            judge_model: None,
            workers: None,
            tasks: Vec::new(),
        }
    }
}

/// Rescale assignment quantities so they sum to `worker_count`, preserving
/// proportions; remainders go to the largest fractional shares.
pub fn normalize_assignments(
    assignments: &[WorkerAssignment],
    worker_count: usize,
    default_model: &str,
) -> Vec<WorkerAssignment> {
    let worker_count = worker_count.max(1);
    let nonzero: Vec<&WorkerAssignment> = assignments.iter().filter(|a| a.quantity > 0).collect();
    if nonzero.is_empty() {
        return vec![WorkerAssignment {
            model: default_model.to_string(),
            quantity: worker_count,
            ..Default::default()
        }];
    }

    let total: usize = nonzero.iter().map(|a| a.quantity).sum();
    let mut scaled: Vec<(WorkerAssignment, f64)> = nonzero
        .iter()
        .map(|a| {
            let exact = a.quantity as f64 * worker_count as f64 / total as f64;
            let mut assignment = (*a).clone();
            assignment.quantity = exact.floor() as usize;
            (assignment, exact.fract())
        })
        .collect();

    let assigned: usize = scaled.iter().map(|(a, _)| a.quantity).sum();
    let mut remainder = worker_count.saturating_sub(assigned);
    // largest fractional shares pick up the leftover slots
    let mut order: Vec<usize> = (0..scaled.len()).collect();
    order.sort_by(|&a, &b| {
        scaled[b].1
            .partial_cmp(&scaled[a].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for index in order {
        if remainder == 0 {
            break;
        }
        scaled[index].0.quantity += 1;
        remainder -= 1;
    }

    scaled
        .into_iter()
        .map(|(assignment, _)| assignment)
        .filter(|a| a.quantity > 0)
        .collect()
}

/// Build worker rows for a run from its assignment table
pub fn provision_workers(run_id: &str, config: &RunConfig) -> Vec<Worker> {
    let mut workers = Vec::new();
    let mut ordinal = 0usize;
    for assignment in &config.workers {
        for _ in 0..assignment.quantity {
            ordinal += 1;
            let label = format!("w{:02}-{}", ordinal, assignment.model);
            workers.push(Worker::provision(run_id, &label, assignment));
        }
    }
    workers
}

/// Observer snapshot of one run
#[derive(Debug, Clone)]
pub struct RunDetail {
    pub run: Run,
    pub tasks: Vec<Task>,
    pub workers: Vec<Worker>,
    pub evaluations: Vec<TaskEvaluation>,
    pub errors: Vec<RunErrorRecord>,
    pub session: Option<SkillOptimizationSession>,
}

/// Single-run driver and front door for callers
pub struct Orchestrator {
    services: Services,
    ingestor: Arc<dyn Ingestor>,
    defaults: RunConfig,
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(services: Services, ingestor: Arc<dyn Ingestor>, defaults: RunConfig) -> Self {
        Self {
            services,
            ingestor,
            defaults,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Validate and normalize a request into an immutable RunConfig
    fn resolve_config(&self, request: &RunRequest) -> eyre::Result<RunConfig> {
        if request.docs_url.trim().is_empty() {
            eyre::bail!("docsUrl must not be empty");
        }
        let defaults = &self.defaults;
        let run_model = request.run_model.clone().unwrap_or_else(|| defaults.run_model.clone());

        let workers_request = request.workers.clone().unwrap_or_default();
        let worker_count = workers_request
            .worker_count
            .or_else(|| {
                let from_assignments: usize =
                    workers_request.assignments.iter().map(|a| a.quantity).sum();
                (from_assignments > 0).then_some(from_assignments)
            })
            .unwrap_or_else(|| defaults.worker_count().max(1));
        let workers =
            normalize_assignments(&workers_request.assignments, worker_count, &run_model);

        Ok(RunConfig {
            max_tasks: request.task_count.unwrap_or(defaults.max_tasks).max(1),
            max_steps_per_task: request
                .max_steps_per_task
                .unwrap_or(defaults.max_steps_per_task)
                .max(1),
            max_tokens_per_task: request
                .max_tokens_per_task
                .unwrap_or(defaults.max_tokens_per_task)
                .max(1),
            hard_cost_cap_usd: request
                .hard_cost_cap_usd
                .unwrap_or(defaults.hard_cost_cap_usd)
                .max(0.0),
            execution_concurrency: request
                .execution_concurrency
                .unwrap_or(defaults.execution_concurrency)
                .max(1),
            judge_concurrency: request
                .judge_concurrency
                .unwrap_or(defaults.judge_concurrency)
                .max(1),
            tie_break_enabled: request.tie_break_enabled.unwrap_or(defaults.tie_break_enabled),
            enable_skill_optimization: request
                .enable_skill_optimization
                .unwrap_or(defaults.enable_skill_optimization),
            run_model,
            judge_model: request
                .judge_model
                .clone()
                .unwrap_or_else(|| defaults.judge_model.clone()),
            timeout_ms: defaults.timeout_ms,
            retries: defaults.retries,
            workers,
            tasks: request.tasks.clone(),
        })
    }

    /// Create a queued run; returns its id
    pub async fn create_run(&self, request: RunRequest) -> eyre::Result<String> {
        let config = self.resolve_config(&request)?;
        let run = Run::new(request.docs_url, config);
        self.services.store.create_run(&run)?;
        self.services
            .events
            .append(
                &run.id,
                event_types::RUN_CREATED,
                EventPayload::new(&run.id, "run created")
                    .with_data(json!({"docsUrl": run.docs_url})),
            )
            .await?;
        info!(run_id = %run.id, docs_url = %run.docs_url, "run created");
        Ok(run.id)
    }

    /// Spawn the driver for a run; duplicate starts for an in-flight run id
    /// are rejected. Returns whether a driver was actually started.
    pub fn start_run_in_background(&self, run_id: &str) -> bool {
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            if !inflight.insert(run_id.to_string()) {
                warn!(%run_id, "duplicate start rejected");
                return false;
            }
        }
        let services = self.services.clone();
        let ingestor = self.ingestor.clone();
        let inflight = self.inflight.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = drive(&services, ingestor.as_ref(), &run_id).await {
                error!(%run_id, error = %e, "run failed");
                sink_fatal(&services, &run_id, &e).await;
            }
            inflight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&run_id);
        });
        true
    }

    /// Cancel a non-terminal run
    pub async fn cancel_run(&self, run_id: &str) -> eyre::Result<()> {
        lifecycle::cancel(&self.services.store, &self.services.events, run_id).await
    }

    /// Snapshot for observers
    pub fn get_run_detail(&self, run_id: &str) -> eyre::Result<RunDetail> {
        let store = &self.services.store;
        Ok(RunDetail {
            run: store.get_run(run_id)?,
            tasks: store.get_tasks(run_id)?,
            workers: store.get_workers(run_id)?,
            evaluations: store.get_evaluations(run_id, None)?,
            errors: store.get_run_errors(run_id)?,
            session: store.get_optimization_session(run_id)?,
        })
    }

    /// Follow a run's events; ends after a terminal event
    pub fn stream_events(&self, run_id: &str, after_id: i64) -> EventStream {
        self.services.events.stream(run_id, after_id)
    }
}

/// The per-run driver: ingest, synthesize tasks, provision workers, execute
/// phases. Finalization of success/cancel paths happens inside the phase
/// executor; errors bubble to the caller's sink.
async fn drive(services: &Services, ingestor: &dyn Ingestor, run_id: &str) -> eyre::Result<()> {
    let run = services.store.get_run(run_id)?;
    if run.is_terminal() {
        info!(%run_id, status = %run.status, "run already terminal; nothing to drive");
        return Ok(());
    }
    services
        .events
        .emit(run_id, event_types::RUN_STARTED, EventPayload::new(run_id, "run started"))
        .await;

    // ingest
    lifecycle::transition(&services.store, &services.events, run_id, RunStatus::Ingesting).await?;
    let ingested = ingestor.ingest(&run.docs_url).await?;
    services
        .store
        .persist_ingestion_artifacts(run_id, &ingested.artifacts)?;
    services
        .events
        .emit(
            run_id,
            event_types::INGESTION_COMPLETED,
            EventPayload::new(run_id, "documentation ingested").with_data(json!({
                "artifacts": ingested.artifacts.len(),
                "normalizedDocsUrl": ingested.normalized_docs_url,
                "hasSkill": ingested.skill_text.is_some(),
            })),
        )
        .await;
    if services.store.is_run_canceled(run_id)? {
        return lifecycle::finalize(&services.store, &services.events, run_id, RunStatus::Canceled, None).await;
    }

    // synthesize tasks
    lifecycle::transition(&services.store, &services.events, run_id, RunStatus::GeneratingTasks).await?;
    let tasks = taskgen::synthesize_tasks(&run, &ingested.artifacts);
    services.store.persist_tasks(&tasks)?;
    services
        .events
        .emit(
            run_id,
            event_types::TASKS_GENERATED,
            EventPayload::new(run_id, format!("{} tasks generated", tasks.len()))
                .with_data(json!({"count": tasks.len()})),
        )
        .await;

    // provision workers (idempotent)
    let workers = provision_workers(run_id, &run.config);
    services.store.ensure_run_workers(run_id, &workers)?;
    if services.store.is_run_canceled(run_id)? {
        return lifecycle::finalize(&services.store, &services.events, run_id, RunStatus::Canceled, None).await;
    }

    // execute
    lifecycle::transition(&services.store, &services.events, run_id, RunStatus::Running).await?;
    phase::execute_phases(services, &run).await
}

/// Outer error sink: record RUN_FATAL, finalize as failed, emit run.failed
async fn sink_fatal(services: &Services, run_id: &str, error: &eyre::Report) {
    if let Err(e) = services
        .store
        .persist_run_error(run_id, "RUN_FATAL", &error.to_string())
    {
        error!(%run_id, error = %e, "failed to record fatal error");
    }
    if let Err(e) = lifecycle::finalize(&services.store, &services.events, run_id, RunStatus::Failed, None).await {
        error!(%run_id, error = %e, "failed to finalize failed run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::FixtureIngestor;
    use crate::llm::MockModelClient;
    use crate::retrieval::snippet_hash;
    use docmodel::ModelOverrides;
    use docstore::Store;
    use std::time::Duration;

    const AUTH_TEXT: &str = "Authentication uses an api key sent in the authorization header.";

    fn scripted_mock() -> MockModelClient {
        let mock = MockModelClient::new();
        mock.respond("Planning request", r#"{"planItems": ["read docs"], "rationale": "go"}"#);
        mock.respond(
            "Action request",
            format!(
                r#"{{"answer": "Send the api key in the authorization header.",
                     "stepOutput": "1. Create an api key. 2. Attach the authorization header.",
                     "citations": [{{"source": "https://d/auth", "snippetHash": "{}", "excerpt": "api key"}}],
                     "done": true}}"#,
                snippet_hash(AUTH_TEXT)
            ),
        );
        mock.respond(
            "Reflection request",
            r#"{"shouldContinue": false, "summary": "done", "confidence": 0.9, "stopReason": "completed"}"#,
        );
        mock.respond(
            "Evidence alignment request",
            r#"{"isSupportedByEvidence": true, "unsupportedClaims": [], "notes": ""}"#,
        );
        mock.respond(
            "Rubric scoring request",
            r#"{"scores": {"completeness": 9, "correctness": 9, "groundedness": 9, "actionability": 9},
                "rationale": "grounded", "confidence": 0.9}"#,
        );
        mock
    }

    fn orchestrator_with(mock: MockModelClient) -> Orchestrator {
        let store = Store::open_in_memory().unwrap();
        let services = Services::new(store, Arc::new(mock)).unwrap();
        let ingestor = FixtureIngestor::new().with_page("https://d/auth", AUTH_TEXT);
        let defaults = RunConfig {
            execution_concurrency: 1,
            judge_concurrency: 1,
            tie_break_enabled: false,
            enable_skill_optimization: false,
            max_tasks: 2,
            ..Default::default()
        };
        Orchestrator::new(services, Arc::new(ingestor), defaults)
    }

    #[test]
    fn test_normalize_assignments_defaults() {
        let normalized = normalize_assignments(&[], 3, "gpt-4o-mini");
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].quantity, 3);
        assert_eq!(normalized[0].model, "gpt-4o-mini");
    }

    #[test]
    fn test_normalize_assignments_rescales_proportionally() {
        let assignments = vec![
            WorkerAssignment {
                model: "a".into(),
                quantity: 2,
                ..Default::default()
            },
            WorkerAssignment {
                model: "b".into(),
                quantity: 2,
                ..Default::default()
            },
        ];
        let normalized = normalize_assignments(&assignments, 6, "x");
        assert_eq!(normalized.iter().map(|a| a.quantity).sum::<usize>(), 6);
        assert_eq!(normalized[0].quantity, 3);
        assert_eq!(normalized[1].quantity, 3);
    }

    #[test]
    fn test_normalize_assignments_uneven_split() {
        let assignments = vec![
            WorkerAssignment {
                model: "a".into(),
                quantity: 1,
                ..Default::default()
            },
            WorkerAssignment {
                model: "b".into(),
                quantity: 1,
                ..Default::default()
            },
            WorkerAssignment {
                model: "c".into(),
                quantity: 1,
                ..Default::default()
            },
        ];
        let normalized = normalize_assignments(&assignments, 4, "x");
        assert_eq!(normalized.iter().map(|a| a.quantity).sum::<usize>(), 4);
        assert_eq!(normalized.len(), 3);
    }

    #[test]
    fn test_provision_workers_unique_labels() {
        let config = RunConfig {
            workers: vec![
                WorkerAssignment {
                    model: "gpt-4o".into(),
                    quantity: 2,
                    overrides: ModelOverrides::default(),
                    provider: "openai".into(),
                },
                WorkerAssignment {
                    model: "gpt-4o-mini".into(),
                    quantity: 1,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let workers = provision_workers("run-1", &config);
        assert_eq!(workers.len(), 3);
        let labels: std::collections::HashSet<_> =
            workers.iter().map(|w| w.worker_label.clone()).collect();
        assert_eq!(labels.len(), 3);
        assert!(workers[0].worker_label.starts_with("w01"));
    }

    #[tokio::test]
    async fn test_create_run_validates_and_emits() {
        let orchestrator = orchestrator_with(scripted_mock());
        let run_id = orchestrator
            .create_run(RunRequest::new("https://docs.example.com"))
            .await
            .unwrap();
        let run = orchestrator.services().store.get_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.config.max_tasks, 2);
        let events = orchestrator
            .services()
            .store
            .get_run_events_after(&run_id, 0, 10)
            .unwrap();
        assert_eq!(events[0].event_type, "run.created");
    }

    #[tokio::test]
    async fn test_create_run_rejects_empty_url() {
        let orchestrator = orchestrator_with(scripted_mock());
        assert!(orchestrator.create_run(RunRequest::new("  ")).await.is_err());
    }

    #[tokio::test]
    async fn test_full_run_completes_in_background() {
        let orchestrator = orchestrator_with(scripted_mock());
        let run_id = orchestrator
            .create_run(RunRequest::new("https://docs.example.com"))
            .await
            .unwrap();
        assert!(orchestrator.start_run_in_background(&run_id));

        let events = orchestrator
            .stream_events(&run_id, 0)
            .collect_to_end()
            .await
            .unwrap();
        assert_eq!(events.last().unwrap().event_type, "run.completed");

        let detail = orchestrator.get_run_detail(&run_id).unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(detail.tasks.len(), 2);
        assert_eq!(detail.evaluations.len(), 2);
        assert!(detail.run.totals.is_some());
        assert!(detail.run.ended_at.is_some());
        assert!(detail.errors.is_empty());
        // events cover every boundary
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"run.started"));
        assert!(types.contains(&"ingestion.completed"));
        assert!(types.contains(&"tasks.generated"));
        assert!(types.contains(&"worker.started"));
        assert!(types.contains(&"task.step.created"));
        assert!(types.contains(&"task.execution.completed"));
        assert!(types.contains(&"phase.completed"));
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected_while_inflight() {
        let orchestrator = orchestrator_with(scripted_mock());
        let run_id = orchestrator
            .create_run(RunRequest::new("https://docs.example.com"))
            .await
            .unwrap();
        assert!(orchestrator.start_run_in_background(&run_id));
        assert!(!orchestrator.start_run_in_background(&run_id));
        // drain so the spawned driver finishes
        orchestrator
            .stream_events(&run_id, 0)
            .collect_to_end()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ingest_failure_is_fatal() {
        let store = Store::open_in_memory().unwrap();
        let services = Services::new(store, Arc::new(scripted_mock())).unwrap();
        // empty fixture: ingest errors
        let orchestrator = Orchestrator::new(
            services,
            Arc::new(FixtureIngestor::new()),
            RunConfig::default(),
        );
        let run_id = orchestrator
            .create_run(RunRequest::new("https://docs.example.com"))
            .await
            .unwrap();
        orchestrator.start_run_in_background(&run_id);

        let events = orchestrator
            .stream_events(&run_id, 0)
            .collect_to_end()
            .await
            .unwrap();
        assert_eq!(events.last().unwrap().event_type, "run.failed");

        let detail = orchestrator.get_run_detail(&run_id).unwrap();
        assert_eq!(detail.run.status, RunStatus::Failed);
        assert!(detail.errors.iter().any(|e| e.code == "RUN_FATAL"));
        assert!(detail.run.totals.is_none());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_reaches_canceled_state() {
        // an agent that never finishes, so cancellation lands mid-loop
        let mock = MockModelClient::new();
        mock.respond("Planning request", r#"{"planItems": ["keep reading"], "rationale": "go"}"#);
        mock.respond(
            "Action request",
            r#"{"answer": "", "stepOutput": "still reading", "citations": [], "done": false}"#,
        );
        mock.respond(
            "Reflection request",
            r#"{"shouldContinue": true, "summary": "more to do", "confidence": 0.3}"#,
        );
        let store = Store::open_in_memory().unwrap();
        let services = Services::new(store, Arc::new(mock)).unwrap();
        let ingestor = FixtureIngestor::new().with_page("https://d/auth", AUTH_TEXT);
        let defaults = RunConfig {
            execution_concurrency: 1,
            judge_concurrency: 1,
            max_steps_per_task: 200,
            max_tasks: 1,
            tie_break_enabled: false,
            enable_skill_optimization: false,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(services, Arc::new(ingestor), defaults);
        let run_id = orchestrator
            .create_run(RunRequest::new("https://docs.example.com"))
            .await
            .unwrap();
        orchestrator.start_run_in_background(&run_id);

        // wait for the first step event, then cancel
        let mut stream = orchestrator.stream_events(&run_id, 0);
        loop {
            match stream.next().await.unwrap() {
                Some(event) if event.event_type == "task.step.created" => break,
                Some(_) => continue,
                None => break,
            }
        }
        orchestrator.cancel_run(&run_id).await.unwrap();

        // drain to terminal
        while stream.next().await.unwrap().is_some() {}

        // wait for the driver to finalize
        for _ in 0..100 {
            if orchestrator
                .get_run_detail(&run_id)
                .map(|d| d.run.ended_at.is_some())
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let detail = orchestrator.get_run_detail(&run_id).unwrap();
        assert_eq!(detail.run.status, RunStatus::Canceled);

        // cancellation liveness: no step events after the cancel event
        let events = orchestrator
            .services()
            .store
            .get_run_events_after(&run_id, 0, 10_000)
            .unwrap();
        let cancel_id = events
            .iter()
            .find(|e| e.event_type == "run.canceled")
            .map(|e| e.id)
            .unwrap();
        let steps_after_cancel = events
            .iter()
            .filter(|e| e.id > cancel_id && e.event_type == "task.step.created")
            .count();
        assert_eq!(steps_after_cancel, 0);
    }
}
