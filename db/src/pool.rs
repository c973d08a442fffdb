//! Worker pool
//!
//! Bounded worker activities consume a FIFO task queue; each pop hands the
//! task to exactly one worker per phase. Evaluations of completed attempts
//! run behind a separate judge semaphore so judging never eats an execution
//! slot. The pool returns once the queue drains (or cancellation empties
//! it) and every spawned evaluation has settled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use docmodel::{
    EvalPhase, EventPayload, ExecutionStatus, Run, StopReason, Task, TaskExecution, TaskStatus,
    Worker, WorkerStatus, event_types,
};
use docstore::StoreError;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::agent::{ExecutionOutcome, TaskAgent, build_query};
use crate::budget::apply_usage_to_execution;
use crate::context::{Services, judge_call_config};
use crate::judge::{
    EVIDENCE_CHUNKS, JudgeRequest, RubricJudge, fallback_evaluation, run_checks,
};
use crate::retrieval::RetrievalIndex;

/// Pop-once FIFO task queue
pub struct TaskQueue {
    inner: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            inner: Mutex::new(tasks.into()),
        }
    }

    /// Single-consumer pop: a task handed out here is never handed out again
    pub fn pop(&self) -> Option<Task> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
struct PoolCtx {
    services: Services,
    run: Run,
    phase: EvalPhase,
    index: Arc<RetrievalIndex>,
    queue: Arc<TaskQueue>,
    judge_sem: Arc<Semaphore>,
    eval_handles: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

/// Run every pending task of one phase through the worker pool
pub async fn run_phase(
    services: &Services,
    run: &Run,
    phase: EvalPhase,
    index: Arc<RetrievalIndex>,
) -> eyre::Result<()> {
    let tasks: Vec<Task> = services
        .store
        .get_tasks(&run.id)?
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    let workers = services.store.get_workers(&run.id)?;
    info!(
        run_id = %run.id,
        %phase,
        tasks = tasks.len(),
        workers = workers.len(),
        "worker pool starting"
    );
    if tasks.is_empty() || workers.is_empty() {
        return Ok(());
    }

    let ctx = PoolCtx {
        services: services.clone(),
        run: run.clone(),
        phase,
        index,
        queue: Arc::new(TaskQueue::new(tasks)),
        judge_sem: Arc::new(Semaphore::new(run.config.judge_concurrency.max(1))),
        eval_handles: Arc::new(tokio::sync::Mutex::new(Vec::new())),
    };

    let concurrency = run.config.execution_concurrency.max(1).min(workers.len());
    let mut activities = JoinSet::new();
    for worker in workers.into_iter().take(concurrency) {
        let ctx = ctx.clone();
        activities.spawn(async move { worker_activity(ctx, worker).await });
    }
    while let Some(joined) = activities.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "worker activity panicked");
        }
    }

    // all executions dispatched; wait for in-flight judgements
    let handles: Vec<JoinHandle<()>> = {
        let mut guard = ctx.eval_handles.lock().await;
        guard.drain(..).collect()
    };
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "evaluation task panicked");
        }
    }
    info!(run_id = %run.id, %phase, "worker pool drained");
    Ok(())
}

async fn worker_activity(ctx: PoolCtx, worker: Worker) {
    let services = &ctx.services;
    if let Err(e) = services.store.update_worker_status(&worker.id, WorkerStatus::Idle) {
        warn!(error = %e, worker = %worker.worker_label, "worker status write failed");
        return;
    }
    services
        .events
        .emit(
            &ctx.run.id,
            event_types::WORKER_STARTED,
            EventPayload::new(&ctx.run.id, format!("worker {} started", worker.worker_label))
                .with_phase(ctx.phase.to_string())
                .with_data(json!({"workerId": worker.id, "workerLabel": worker.worker_label})),
        )
        .await;

    loop {
        let Some(task) = ctx.queue.pop() else {
            debug!(worker = %worker.worker_label, "queue empty");
            break;
        };
        match services.store.is_run_canceled(&ctx.run.id) {
            Ok(false) => {}
            _ => {
                debug!(worker = %worker.worker_label, "cancellation observed between tasks");
                break;
            }
        }
        if let Err(e) = drive_one_task(&ctx, &worker, &task).await {
            warn!(error = %e, task_id = %task.task_id, "task drive failed at pool boundary");
        }
        if services
            .store
            .update_worker_status(&worker.id, WorkerStatus::Idle)
            .is_err()
        {
            break;
        }
    }

    if let Err(e) = services.store.update_worker_status(&worker.id, WorkerStatus::Done) {
        warn!(error = %e, worker = %worker.worker_label, "worker done write failed");
    }
    services
        .events
        .emit(
            &ctx.run.id,
            event_types::WORKER_STOPPED,
            EventPayload::new(&ctx.run.id, format!("worker {} stopped", worker.worker_label))
                .with_phase(ctx.phase.to_string())
                .with_data(json!({"workerId": worker.id})),
        )
        .await;
}

async fn drive_one_task(ctx: &PoolCtx, worker: &Worker, task: &Task) -> eyre::Result<()> {
    let services = &ctx.services;
    let run = &ctx.run;

    // run-level cost pre-check: tasks beyond the cap are skipped, not judged
    if services.store.run_cost(&run.id)? >= run.config.hard_cost_cap_usd {
        let execution = TaskExecution::new(&run.id, &task.task_id, &worker.id, ctx.phase);
        match services.store.create_task_execution(&execution) {
            Err(StoreError::RunTerminal(_)) => return Ok(()),
            other => other?,
        }
        skip_task(ctx, task, &execution, StopReason::CostLimit).await;
        return Ok(());
    }

    services.store.update_worker_status(&worker.id, WorkerStatus::Running)?;
    services.store.update_task_status(&task.task_id, TaskStatus::Running)?;
    let execution = TaskExecution::new(&run.id, &task.task_id, &worker.id, ctx.phase);
    match services.store.create_task_execution(&execution) {
        Err(StoreError::RunTerminal(_)) => return Ok(()),
        other => other?,
    }
    services
        .events
        .emit(
            &run.id,
            event_types::TASK_STARTED,
            EventPayload::new(&run.id, format!("task {} started", task.name))
                .with_phase(ctx.phase.to_string())
                .with_data(json!({
                    "taskId": task.task_id,
                    "taskExecutionId": execution.id,
                    "workerLabel": worker.worker_label,
                })),
        )
        .await;

    let agent = TaskAgent::new(
        services.store.clone(),
        services.events.clone(),
        services.model.clone(),
        services.prompts.clone(),
        services.cost_model.clone(),
    );

    match agent.run(run, task, worker, &execution, &ctx.index).await {
        Ok(outcome) => match outcome.stop_reason {
            StopReason::Cancelled => skip_task(ctx, task, &execution, StopReason::Cancelled).await,
            StopReason::CostLimit => skip_task(ctx, task, &execution, StopReason::CostLimit).await,
            _ => {
                match services.store.persist_task_attempt(
                    &run.id,
                    &execution.id,
                    &task.task_id,
                    ctx.phase,
                    &outcome.attempt.answer,
                    &outcome.attempt.steps,
                ) {
                    Err(StoreError::RunTerminal(_)) => {
                        skip_task(ctx, task, &execution, StopReason::Cancelled).await;
                        return Ok(());
                    }
                    other => other?,
                }
                submit_evaluation(ctx, task.clone(), execution, outcome).await;
            }
        },
        Err(e) if e.is_run_terminal() => {
            skip_task(ctx, task, &execution, StopReason::Cancelled).await;
        }
        Err(e) => {
            fail_task(ctx, task, &execution, &e.to_string()).await;
        }
    }
    Ok(())
}

/// Finalize an execution as skipped (cancellation or cost cap): no attempt,
/// no evaluation
async fn skip_task(ctx: &PoolCtx, task: &Task, execution: &TaskExecution, reason: StopReason) {
    let services = &ctx.services;
    if let Err(e) =
        services
            .store
            .finalize_task_execution(&execution.id, ExecutionStatus::Skipped, Some(reason))
    {
        warn!(error = %e, exec_id = %execution.id, "skip finalize failed");
    }
    if let Err(e) = services.store.update_task_status(&task.task_id, TaskStatus::Skipped) {
        warn!(error = %e, task_id = %task.task_id, "skip status write failed");
    }
    services
        .events
        .emit(
            &ctx.run.id,
            event_types::TASK_SKIPPED,
            EventPayload::new(&ctx.run.id, format!("task {} skipped", task.name))
                .with_phase(ctx.phase.to_string())
                .with_data(json!({
                    "taskId": task.task_id,
                    "taskExecutionId": execution.id,
                    "stopReason": reason.to_string(),
                })),
        )
        .await;
}

/// Task-execution error path: fallback evaluation, execution error, run
/// error ledger entry. The run keeps going.
async fn fail_task(ctx: &PoolCtx, task: &Task, execution: &TaskExecution, detail: &str) {
    let services = &ctx.services;
    warn!(task_id = %task.task_id, %detail, "task execution error");
    if let Err(e) = services
        .store
        .persist_run_error(&ctx.run.id, "TASK_EXECUTION_ERROR", detail)
    {
        warn!(error = %e, "run error write failed");
    }
    let fallback = fallback_evaluation(
        &ctx.run.id,
        &task.task_id,
        ctx.phase,
        &ctx.run.config.judge_model,
        detail,
    );
    if let Err(e) = services.store.persist_task_evaluation(&fallback) {
        warn!(error = %e, "fallback evaluation write failed");
    }
    if let Err(e) = services.store.finalize_task_execution(
        &execution.id,
        ExecutionStatus::Error,
        Some(StopReason::Error),
    ) {
        warn!(error = %e, "error finalize failed");
    }
    if let Err(e) = services.store.update_task_status(&task.task_id, TaskStatus::Error) {
        warn!(error = %e, "error status write failed");
    }
    services
        .events
        .emit(
            &ctx.run.id,
            event_types::TASK_ERROR,
            EventPayload::new(&ctx.run.id, format!("task {} errored", task.name))
                .with_phase(ctx.phase.to_string())
                .with_data(json!({
                    "taskId": task.task_id,
                    "taskExecutionId": execution.id,
                    "detail": detail,
                })),
        )
        .await;
}

/// Queue the evaluation of a finished attempt behind the judge semaphore
async fn submit_evaluation(
    ctx: &PoolCtx,
    task: Task,
    execution: TaskExecution,
    outcome: ExecutionOutcome,
) {
    let eval_ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        let Ok(_permit) = eval_ctx.judge_sem.clone().acquire_owned().await else {
            return;
        };
        evaluate_one(&eval_ctx, &task, &execution, &outcome).await;
    });
    ctx.eval_handles.lock().await.push(handle);
}

async fn evaluate_one(
    ctx: &PoolCtx,
    task: &Task,
    execution: &TaskExecution,
    outcome: &ExecutionOutcome,
) {
    let services = &ctx.services;
    let run = &ctx.run;
    let result: eyre::Result<()> = async {
        let guard_outcome = run_checks(
            &execution.id,
            task,
            &outcome.attempt,
            outcome.step_count,
            outcome.stop_reason,
            &ctx.index,
        );
        services
            .store
            .persist_deterministic_checks(&run.id, &guard_outcome.checks)?;

        let evidence = ctx
            .index
            .query(&build_query(task, &Default::default()), EVIDENCE_CHUNKS);
        let judge = RubricJudge::new(
            services.model.clone(),
            services.prompts.clone(),
            judge_call_config(&run.config),
        );
        let (evaluation, usage) = judge
            .evaluate(JudgeRequest {
                run_id: &run.id,
                task,
                attempt: &outcome.attempt,
                guard: &guard_outcome,
                evidence: &evidence,
                stop_reason: outcome.stop_reason,
                phase: ctx.phase,
                tie_break_enabled: run.config.tie_break_enabled,
            })
            .await?;
        apply_usage_to_execution(&services.store, services.cost_model.as_ref(), &execution.id, &usage)?;
        services.store.persist_task_evaluation(&evaluation)?;

        let status = if evaluation.pass {
            (ExecutionStatus::Passed, TaskStatus::Passed)
        } else {
            (ExecutionStatus::Failed, TaskStatus::Failed)
        };
        services
            .store
            .finalize_task_execution(&execution.id, status.0, Some(outcome.stop_reason))?;
        services.store.update_task_status(&task.task_id, status.1)?;
        services
            .events
            .emit(
                &run.id,
                event_types::TASK_EXECUTION_COMPLETED,
                EventPayload::new(&run.id, format!("task {} evaluated", task.name))
                    .with_phase(ctx.phase.to_string())
                    .with_data(json!({
                        "taskId": task.task_id,
                        "taskExecutionId": execution.id,
                        "pass": evaluation.pass,
                        "average": evaluation.criterion_scores.average,
                        "stopReason": outcome.stop_reason.to_string(),
                    })),
            )
            .await;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        if matches!(
            e.downcast_ref::<StoreError>(),
            Some(StoreError::RunTerminal(_))
        ) {
            // cancellation landed under the judge; partial evaluations are
            // whatever made it in before this point
            debug!(exec_id = %execution.id, "evaluation dropped after cancellation");
            return;
        }
        fail_task(ctx, task, execution, &e.to_string()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{FixtureIngestor, Ingestor};
    use crate::llm::MockModelClient;
    use crate::retrieval::snippet_hash;
    use docmodel::{RunConfig, RunStatus};
    use docstore::Store;

    const AUTH_TEXT: &str = "Authentication uses an api key sent in the authorization header.";

    fn plan_json() -> &'static str {
        r#"{"planItems": ["read docs"], "rationale": "start"}"#
    }

    fn act_first_json() -> String {
        format!(
            r#"{{"answer": "",
                 "stepOutput": "1. Create an api key in the dashboard.",
                 "citations": [{{"source": "https://d/auth", "snippetHash": "{}", "excerpt": "api key"}}],
                 "done": false}}"#,
            snippet_hash(AUTH_TEXT)
        )
    }

    fn act_done_json() -> String {
        format!(
            r#"{{"answer": "Send the api key in the authorization header.",
                 "stepOutput": "2. Attach the authorization header to every request.",
                 "citations": [{{"source": "https://d/auth", "snippetHash": "{}", "excerpt": "api key"}}],
                 "done": true}}"#,
            snippet_hash(AUTH_TEXT)
        )
    }

    fn reflect_stop_json() -> &'static str {
        r#"{"shouldContinue": false, "summary": "done", "confidence": 0.9, "stopReason": "completed"}"#
    }

    fn alignment_ok_json() -> &'static str {
        r#"{"isSupportedByEvidence": true, "unsupportedClaims": [], "notes": ""}"#
    }

    fn rubric_high_json() -> &'static str {
        r#"{"scores": {"completeness": 9, "correctness": 9, "groundedness": 9, "actionability": 9},
            "rationale": "grounded and complete", "confidence": 0.9}"#
    }

    fn scripted_mock() -> MockModelClient {
        let mock = MockModelClient::new();
        mock.respond("Planning request", plan_json());
        mock.respond_seq("Action request", vec![act_first_json(), act_done_json()]);
        mock.respond("Reflection request", reflect_stop_json());
        mock.respond("Evidence alignment request", alignment_ok_json());
        mock.respond("Rubric scoring request", rubric_high_json());
        mock
    }

    async fn seeded_run(config: RunConfig, mock: MockModelClient) -> (Services, Run, Arc<RetrievalIndex>) {
        let store = Store::open_in_memory().unwrap();
        let services = Services::new(store, Arc::new(mock)).unwrap();
        let run = Run::new("https://docs.example.com", config);
        services.store.create_run(&run).unwrap();

        let outcome = FixtureIngestor::new()
            .with_page("https://d/auth", AUTH_TEXT)
            .ingest(&run.docs_url)
            .await
            .unwrap();
        services
            .store
            .persist_ingestion_artifacts(&run.id, &outcome.artifacts)
            .unwrap();

        let tasks = vec![
            docmodel::Task::new(&run.id, "Authenticate")
                .with_description("Authenticate against the API")
                .with_signals(vec!["api key".into(), "authorization header".into()]),
        ];
        services.store.persist_tasks(&tasks).unwrap();

        let workers = vec![docmodel::Worker::provision(
            &run.id,
            "w01",
            &docmodel::WorkerAssignment::default(),
        )];
        services.store.ensure_run_workers(&run.id, &workers).unwrap();

        let index = Arc::new(RetrievalIndex::build(
            &services.store.get_artifacts(&run.id).unwrap(),
        ));
        (services, run, index)
    }

    #[test]
    fn test_queue_pops_each_task_once() {
        let tasks: Vec<Task> = (0..5)
            .map(|i| Task::new("r", format!("task {}", i)))
            .collect();
        let queue = TaskQueue::new(tasks);
        let mut seen = Vec::new();
        while let Some(task) = queue.pop() {
            seen.push(task.name);
        }
        assert_eq!(seen.len(), 5);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
        // FIFO order preserved
        assert_eq!(seen[0], "task 0");
        assert_eq!(seen[4], "task 4");
    }

    #[tokio::test]
    async fn test_run_phase_passes_clean_task() {
        let (services, run, index) = seeded_run(RunConfig::default(), scripted_mock()).await;
        run_phase(&services, &run, EvalPhase::Baseline, index).await.unwrap();

        let tasks = services.store.get_tasks(&run.id).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Passed);

        let evaluations = services.store.get_evaluations(&run.id, Some(EvalPhase::Baseline)).unwrap();
        assert_eq!(evaluations.len(), 1);
        assert!(evaluations[0].pass);
        assert_eq!(evaluations[0].failure_class, None);

        let executions = services.store.list_task_executions(&run.id).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Passed);
        assert_eq!(executions[0].stop_reason, Some(StopReason::Completed));

        let workers = services.store.get_workers(&run.id).unwrap();
        assert_eq!(workers[0].status, WorkerStatus::Done);

        // deterministic checks persisted for inspection
        let checks = services.store.get_deterministic_checks(&executions[0].id).unwrap();
        assert_eq!(checks.len(), 5);
        assert!(checks.iter().all(|c| c.passed));
    }

    #[tokio::test]
    async fn test_missing_citations_fail_with_block() {
        let mock = MockModelClient::new();
        mock.respond("Planning request", plan_json());
        mock.respond(
            "Action request",
            r#"{"answer": "Send the api key in the authorization header.",
                "stepOutput": "1. Create an api key. 2. Attach the authorization header.",
                "citations": [], "done": true}"#,
        );
        mock.respond("Reflection request", reflect_stop_json());
        mock.respond("Evidence alignment request", alignment_ok_json());
        mock.respond("Rubric scoring request", rubric_high_json());

        let (services, run, index) = seeded_run(RunConfig::default(), mock).await;
        run_phase(&services, &run, EvalPhase::Baseline, index).await.unwrap();

        let evaluations = services.store.get_evaluations(&run.id, None).unwrap();
        assert_eq!(evaluations.len(), 1);
        let evaluation = &evaluations[0];
        assert!(!evaluation.pass);
        assert!(!evaluation.validity_pass);
        assert!(
            evaluation
                .validity_blocked_reasons
                .contains(&"missing_citations".to_string())
        );
        assert!(evaluation.criterion_scores.groundedness <= 3.0);
        assert_eq!(
            services.store.get_tasks(&run.id).unwrap()[0].status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_cost_cap_skips_remaining_tasks() {
        let config = RunConfig {
            hard_cost_cap_usd: 0.000_000_1,
            ..Default::default()
        };
        let (services, run, index) = seeded_run(config, scripted_mock()).await;
        // two more tasks behind the first
        let more = vec![
            docmodel::Task::new(&run.id, "Second task").with_signals(vec!["api key".into()]),
            docmodel::Task::new(&run.id, "Third task").with_signals(vec!["api key".into()]),
        ];
        services.store.persist_tasks(&more).unwrap();

        run_phase(&services, &run, EvalPhase::Baseline, index).await.unwrap();

        let executions = services.store.list_task_executions(&run.id).unwrap();
        assert_eq!(executions.len(), 3);
        // the first execution blew the cap mid-run, the rest never started
        let skipped: Vec<_> = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 3);
        assert!(skipped.iter().all(|e| e.stop_reason == Some(StopReason::CostLimit)));
        // no evaluation rows for skipped work
        assert!(services.store.get_evaluations(&run.id, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_error_produces_fallback_evaluation() {
        // no mock rules at all: the first model call errors out
        let (services, run, index) = seeded_run(RunConfig::default(), MockModelClient::new()).await;
        run_phase(&services, &run, EvalPhase::Baseline, index).await.unwrap();

        let evaluations = services.store.get_evaluations(&run.id, None).unwrap();
        assert_eq!(evaluations.len(), 1);
        assert!(!evaluations[0].pass);
        assert_eq!(
            evaluations[0].validity_blocked_reasons,
            vec!["execution_error".to_string()]
        );
        let executions = services.store.list_task_executions(&run.id).unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Error);
        let errors = services.store.get_run_errors(&run.id).unwrap();
        assert!(errors.iter().any(|e| e.code == "TASK_EXECUTION_ERROR"));
        assert_eq!(
            services.store.get_tasks(&run.id).unwrap()[0].status,
            TaskStatus::Error
        );
    }

    #[tokio::test]
    async fn test_canceled_run_executes_nothing() {
        let (services, run, index) = seeded_run(RunConfig::default(), scripted_mock()).await;
        services.store.update_run_status(&run.id, RunStatus::Canceled).unwrap();
        run_phase(&services, &run, EvalPhase::Baseline, index).await.unwrap();

        // worker observed cancellation before starting any task
        assert!(services.store.list_task_executions(&run.id).unwrap().is_empty());
        assert!(services.store.count_task_steps(&run.id).unwrap() == 0);
    }
}
