//! Agent loop engine
//!
//! Drives one (task, worker) execution through bounded iterations of
//! retrieve, plan, act, reflect. Usage is applied to the budget after every
//! model call and the ordered termination checks run between phases, so an
//! exhausted or canceled execution stops at the next boundary rather than
//! the end of the iteration.

use std::sync::{Arc, LazyLock};

use docmodel::{
    AgentMemoryState, ChunkRef, EventPayload, RetrievalAttachment, Run, StepCitation, StepDecision,
    StepPhase, StepTrace, StopReason, Task, TaskExecution, Worker, event_types,
};
use docstore::{Store, StoreError};
use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::budget::{BudgetAccountant, CostModel, StopSignal};
use crate::events::EventLog;
use crate::judge::{Attempt, signal_coverage};
use crate::llm::{
    ChatMessage, JsonCompletion, ModelCallConfig, ModelClient, complete_json, schema_of,
};
use crate::prompts;
use crate::prompts::PromptRegistry;
use crate::retrieval::{RankedChunk, RetrievalIndex};

use super::outputs::{ActOutput, PlanOutput, ReflectOutput};

/// Chunks fetched per retrieve phase
pub const RETRIEVE_TOP_K: usize = 8;

/// Coverage below which reflection is overridden to continue
const REFLECT_COVERAGE_THRESHOLD: f64 = 0.75;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] crate::llm::ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("prompt render failed: {0}")]
    Prompt(String),
}

impl AgentError {
    /// A terminal-run store rejection means cancellation won the race with
    /// one of our writes
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, AgentError::Store(StoreError::RunTerminal(_)))
    }
}

/// What one driven execution produced
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub stop_reason: StopReason,
    pub attempt: Attempt,
    pub step_count: u32,
}

static UNRESOLVED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bno\s+\w+\s+(found|available|documented)\b|\bunable\s+to\s+(find|locate|identify|determine)\b")
        .expect("unresolved-text pattern is valid")
});

/// Whether the answer text reads like the agent gave up
pub fn looks_unresolved(text: &str) -> bool {
    UNRESOLVED_RE.is_match(text)
}

/// Classify a reflect-supplied stop reason string into completed or error
pub fn classify_stop(stop_reason: Option<&str>) -> StopReason {
    let Some(reason) = stop_reason else {
        return StopReason::Completed;
    };
    let reason = reason.to_lowercase();
    let error_markers = ["error", "fail", "block", "cannot", "unable", "stuck"];
    if error_markers.iter().any(|m| reason.contains(m)) {
        StopReason::Error
    } else {
        StopReason::Completed
    }
}

/// Retrieval query: task identity, expected signals, open plan items, the
/// last two summaries and last five facts
pub fn build_query(task: &Task, memory: &AgentMemoryState) -> String {
    let mut parts: Vec<String> = vec![task.name.clone(), task.description.clone()];
    parts.extend(task.expected_signals.iter().cloned());
    parts.extend(memory.pending_plan_items().iter().map(|s| s.to_string()));
    parts.extend(memory.last_summaries(2).iter().map(|s| s.to_string()));
    parts.extend(memory.last_facts(5).iter().map(|s| s.to_string()));
    parts.retain(|p| !p.trim().is_empty());
    parts.join("\n")
}

fn signal_to_stop(signal: StopSignal) -> StopReason {
    match signal {
        StopSignal::TokenLimit => StopReason::TokenLimit,
        StopSignal::Cancelled => StopReason::Cancelled,
        StopSignal::CostLimit => StopReason::CostLimit,
    }
}

fn build_call_config(run: &Run, worker: &Worker) -> ModelCallConfig {
    ModelCallConfig {
        model: worker.model_name.clone(),
        temperature: worker.model_config.temperature,
        max_output_tokens: worker.model_config.max_output_tokens.unwrap_or(4096),
        timeout_ms: worker.model_config.timeout_ms.unwrap_or(run.config.timeout_ms),
        retries: run.config.retries,
    }
}

/// Per-task execution driver
pub struct TaskAgent {
    store: Store,
    events: EventLog,
    model: Arc<dyn ModelClient>,
    prompts: Arc<PromptRegistry>,
    cost_model: Arc<dyn CostModel>,
}

impl TaskAgent {
    pub fn new(
        store: Store,
        events: EventLog,
        model: Arc<dyn ModelClient>,
        prompts: Arc<PromptRegistry>,
        cost_model: Arc<dyn CostModel>,
    ) -> Self {
        Self {
            store,
            events,
            model,
            prompts,
            cost_model,
        }
    }

    /// Drive the loop to a stop reason; the caller owns evaluation and
    /// execution finalization.
    pub async fn run(
        &self,
        run: &Run,
        task: &Task,
        worker: &Worker,
        execution: &TaskExecution,
        index: &RetrievalIndex,
    ) -> Result<ExecutionOutcome, AgentError> {
        info!(task_id = %task.task_id, worker = %worker.worker_label, exec_id = %execution.id, "agent loop starting");
        let call_config = build_call_config(run, worker);
        let mut accountant = BudgetAccountant::new(
            self.store.clone(),
            self.cost_model.clone(),
            &run.config,
            &run.id,
            &execution.id,
        );

        let goal = if task.description.trim().is_empty() {
            task.name.clone()
        } else {
            task.description.clone()
        };
        let mut memory = AgentMemoryState::for_goal(goal, accountant.remaining()?);
        self.store
            .upsert_task_agent_state(&execution.id, &run.id, &memory)?;

        let mut attempt = Attempt::default();

        let stop_reason = loop {
            if accountant.steps_exhausted() {
                break StopReason::StepLimit;
            }
            if self.store.is_run_canceled(&run.id)? {
                break StopReason::Cancelled;
            }
            let step_index = accountant.steps_used();
            accountant.begin_iteration()?;
            debug!(exec_id = %execution.id, step_index, "iteration starting");

            // retrieve
            let query = build_query(task, &memory);
            let ranked = index.query(&query, RETRIEVE_TOP_K);
            let refs: Vec<ChunkRef> = ranked
                .iter()
                .map(|c| ChunkRef {
                    source_url: c.source_url.clone(),
                    snippet_hash: c.snippet_hash.clone(),
                    score: c.score,
                })
                .collect();
            let retrieval = RetrievalAttachment {
                query: query.clone(),
                chunks: refs.clone(),
            };
            let step = StepTrace::new(&execution.id, step_index, StepPhase::Retrieve)
                .with_input(json!({ "query": query }))
                .with_output(serde_json::to_value(&refs)?)
                .with_retrieval(retrieval.clone());
            self.store.persist_task_step(&run.id, &step)?;
            self.emit_step(run, task, execution, step_index, StepPhase::Retrieve).await;

            if self.store.is_run_canceled(&run.id)? {
                break StopReason::Cancelled;
            }

            // plan
            let plan = self.plan_call(&call_config, task, &memory, step_index).await?;
            let plan_usage = accountant.apply(&plan.usage)?;
            let step = StepTrace::new(&execution.id, step_index, StepPhase::Plan)
                .with_input(json!({
                    "pendingPlan": memory.pending_plan_items(),
                    "stepIndex": step_index,
                }))
                .with_output(serde_json::to_value(&plan.parsed)?)
                .with_usage(plan_usage);
            self.store.persist_task_step(&run.id, &step)?;
            self.emit_step(run, task, execution, step_index, StepPhase::Plan).await;
            if let Some(signal) = accountant.check_after_call()? {
                break signal_to_stop(signal);
            }

            // act
            let act = self.act_call(&call_config, task, &memory, &ranked).await?;
            let act_usage = accountant.apply(&act.usage)?;
            let citations: Vec<StepCitation> = act
                .parsed
                .citations
                .iter()
                .cloned()
                .map(|c| c.into_step_citation())
                .collect();
            let step = StepTrace::new(&execution.id, step_index, StepPhase::Act)
                .with_input(json!({ "evidenceChunks": ranked.len() }))
                .with_output(serde_json::to_value(&act.parsed)?)
                .with_retrieval(retrieval)
                .with_usage(act_usage);
            let step_id = self.store.persist_task_step(&run.id, &step)?;
            self.store
                .persist_task_step_citations(&run.id, step_id, &citations)?;
            self.emit_step(run, task, execution, step_index, StepPhase::Act).await;

            if !act.parsed.answer.trim().is_empty() {
                attempt.answer = act.parsed.answer.clone();
            }
            if !act.parsed.step_output.trim().is_empty() {
                attempt.steps.push(act.parsed.step_output.clone());
            }
            for citation in citations {
                let seen = attempt.citations.iter().any(|c| {
                    c.source == citation.source
                        && c.snippet_hash == citation.snippet_hash
                        && c.excerpt == citation.excerpt
                });
                if !seen {
                    attempt.citations.push(citation);
                }
            }
            if let Some(signal) = accountant.check_after_call()? {
                break signal_to_stop(signal);
            }

            // reflect
            let reflect = self.reflect_call(&call_config, task, &act.parsed, &accountant).await?;
            let reflect_usage = accountant.apply(&reflect.usage)?;
            let combined = format!("{}\n{}", act.parsed.answer, act.parsed.step_output);
            let coverage = signal_coverage(&combined, &task.expected_signals);
            let mut should_continue = reflect.parsed.should_continue;
            if !act.parsed.done
                && (step_index < 2
                    || coverage < REFLECT_COVERAGE_THRESHOLD
                    || act.parsed.citations.is_empty()
                    || looks_unresolved(&combined))
            {
                debug!(exec_id = %execution.id, coverage, "reflect decision overridden to continue");
                should_continue = true;
            }
            let step = StepTrace::new(&execution.id, step_index, StepPhase::Reflect)
                .with_input(json!({ "coverage": coverage, "actDone": act.parsed.done }))
                .with_output(serde_json::to_value(&reflect.parsed)?)
                .with_usage(reflect_usage)
                .with_decision(StepDecision {
                    should_continue,
                    stop_reason: reflect.parsed.stop_reason.clone(),
                });
            self.store.persist_task_step(&run.id, &step)?;
            self.emit_step(run, task, execution, step_index, StepPhase::Reflect).await;

            // memory update
            memory.current_step = accountant.steps_used();
            memory.absorb_plan(&plan.parsed.plan_items, &reflect.parsed.plan_updates);
            memory.absorb_sources(ranked.iter().map(|c| (c.source_url.as_str(), c.snippet_hash.as_str())));
            memory.absorb_facts(&act.parsed.discovered_facts);
            memory.absorb_summary(&reflect.parsed.summary);
            memory.remaining_budget = accountant.remaining()?;
            self.store
                .upsert_task_agent_state(&execution.id, &run.id, &memory)?;

            // termination precedence: budget signals, then the agent's own
            // completion claim, then the (possibly overridden) reflection
            if let Some(signal) = accountant.check_after_call()? {
                break signal_to_stop(signal);
            }
            if act.parsed.done {
                break StopReason::Completed;
            }
            if !should_continue {
                break classify_stop(reflect.parsed.stop_reason.as_deref());
            }
        };

        info!(
            exec_id = %execution.id,
            %stop_reason,
            steps = accountant.steps_used(),
            cost = accountant.cost_used(),
            "agent loop finished"
        );
        Ok(ExecutionOutcome {
            stop_reason,
            attempt,
            step_count: accountant.steps_used(),
        })
    }

    async fn emit_step(
        &self,
        run: &Run,
        task: &Task,
        execution: &TaskExecution,
        step_index: u32,
        phase: StepPhase,
    ) {
        let payload = EventPayload::new(&run.id, format!("step {} {}", step_index, phase))
            .with_phase(execution.phase.to_string())
            .with_data(json!({
                "taskId": task.task_id,
                "taskExecutionId": execution.id,
                "stepIndex": step_index,
                "stepPhase": phase.to_string(),
            }));
        self.events
            .emit(&run.id, event_types::TASK_STEP_CREATED, payload)
            .await;
    }

    async fn plan_call(
        &self,
        call_config: &ModelCallConfig,
        task: &Task,
        memory: &AgentMemoryState,
        step_index: u32,
    ) -> Result<JsonCompletion<PlanOutput>, AgentError> {
        let schema = schema_of::<PlanOutput>();
        let user = self
            .prompts
            .render(
                "plan",
                &json!({
                    "task_name": task.name,
                    "task_description": task.description,
                    "expected_signals": task.expected_signals,
                    "pending_plan": memory.pending_plan_items(),
                    "summaries": memory.last_summaries(2),
                    "facts": memory.last_facts(5),
                    "step_index": step_index,
                    "remaining_steps": memory.remaining_budget.steps,
                    "schema": schema,
                }),
            )
            .map_err(|e| AgentError::Prompt(e.to_string()))?;
        Ok(complete_json(
            self.model.as_ref(),
            call_config,
            vec![ChatMessage::system(prompts::PLAN_SYSTEM), ChatMessage::user(user)],
            &schema,
        )
        .await?)
    }

    async fn act_call(
        &self,
        call_config: &ModelCallConfig,
        task: &Task,
        memory: &AgentMemoryState,
        chunks: &[RankedChunk],
    ) -> Result<JsonCompletion<ActOutput>, AgentError> {
        let schema = schema_of::<ActOutput>();
        let user = self
            .prompts
            .render(
                "act",
                &json!({
                    "task_name": task.name,
                    "task_description": task.description,
                    "pending_plan": memory.pending_plan_items(),
                    "chunks": chunks.iter().map(|c| json!({
                        "source_url": c.source_url,
                        "snippet_hash": c.snippet_hash,
                        "text": c.text,
                    })).collect::<Vec<_>>(),
                    "schema": schema,
                }),
            )
            .map_err(|e| AgentError::Prompt(e.to_string()))?;
        Ok(complete_json(
            self.model.as_ref(),
            call_config,
            vec![ChatMessage::system(prompts::ACT_SYSTEM), ChatMessage::user(user)],
            &schema,
        )
        .await?)
    }

    async fn reflect_call(
        &self,
        call_config: &ModelCallConfig,
        task: &Task,
        act: &ActOutput,
        accountant: &BudgetAccountant,
    ) -> Result<JsonCompletion<ReflectOutput>, AgentError> {
        let schema = schema_of::<ReflectOutput>();
        let user = self
            .prompts
            .render(
                "reflect",
                &json!({
                    "task_name": task.name,
                    "expected_signals": task.expected_signals,
                    "answer": act.answer,
                    "step_output": act.step_output,
                    "act_done": act.done,
                    "done_reason": act.done_reason,
                    "citation_count": act.citations.len(),
                    "remaining_steps": accountant.remaining()?.steps,
                    "schema": schema,
                }),
            )
            .map_err(|e| AgentError::Prompt(e.to_string()))?;
        Ok(complete_json(
            self.model.as_ref(),
            call_config,
            vec![ChatMessage::system(prompts::REFLECT_SYSTEM), ChatMessage::user(user)],
            &schema,
        )
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::FlatRateCostModel;
    use crate::llm::MockModelClient;
    use crate::retrieval::snippet_hash;
    use docmodel::{Artifact, ArtifactType, EvalPhase, RunConfig, WorkerAssignment};

    const CHUNK_TEXT: &str = "Authentication uses an api key sent in the authorization header.";

    fn fixture(config: RunConfig) -> (Store, Run, Task, Worker, TaskExecution, RetrievalIndex) {
        let store = Store::open_in_memory().unwrap();
        let run = Run::new("https://docs.example.com", config);
        store.create_run(&run).unwrap();
        let task = Task::new(&run.id, "Authenticate")
            .with_description("Authenticate against the API")
            .with_signals(vec!["api key".into(), "authorization header".into()]);
        store.persist_tasks(std::slice::from_ref(&task)).unwrap();
        let worker = Worker::provision(&run.id, "w01", &WorkerAssignment::default());
        store.ensure_run_workers(&run.id, std::slice::from_ref(&worker)).unwrap();
        let execution = TaskExecution::new(&run.id, &task.task_id, &worker.id, EvalPhase::Baseline);
        store.create_task_execution(&execution).unwrap();
        let index = RetrievalIndex::build(&[Artifact {
            artifact_type: ArtifactType::Page,
            source_url: "https://d/auth".into(),
            content: CHUNK_TEXT.into(),
            content_hash: "h".into(),
            metadata: None,
        }]);
        (store, run, task, worker, execution, index)
    }

    fn agent(store: &Store, mock: MockModelClient) -> TaskAgent {
        TaskAgent::new(
            store.clone(),
            EventLog::new(store.clone()),
            Arc::new(mock),
            Arc::new(PromptRegistry::new().unwrap()),
            Arc::new(FlatRateCostModel::default()),
        )
    }

    fn plan_json() -> &'static str {
        r#"{"planItems": ["read the auth page", "write the steps"], "rationale": "start"}"#
    }

    fn act_done_json() -> String {
        format!(
            r#"{{"answer": "Send the api key in the authorization header.",
                 "stepOutput": "1. Create an api key. 2. Attach the authorization header.",
                 "citations": [{{"source": "https://d/auth", "snippetHash": "{}", "excerpt": "api key"}}],
                 "done": true, "discoveredFacts": ["keys live in the dashboard"]}}"#,
            snippet_hash(CHUNK_TEXT)
        )
    }

    fn act_not_done_json() -> &'static str {
        r#"{"answer": "", "stepOutput": "still reading", "citations": [], "done": false}"#
    }

    fn reflect_stop_json() -> &'static str {
        r#"{"shouldContinue": false, "summary": "answer complete", "confidence": 0.9, "stopReason": "completed"}"#
    }

    fn reflect_continue_json() -> &'static str {
        r#"{"shouldContinue": true, "summary": "keep digging", "planUpdates": ["check examples"], "confidence": 0.4}"#
    }

    #[tokio::test]
    async fn test_happy_path_completes_in_one_iteration() {
        let (store, run, task, worker, execution, index) = fixture(RunConfig::default());
        let mock = MockModelClient::new();
        mock.respond("Planning request", plan_json());
        mock.respond("Action request", act_done_json());
        mock.respond("Reflection request", reflect_stop_json());
        let agent = agent(&store, mock);

        let outcome = agent.run(&run, &task, &worker, &execution, &index).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.step_count, 1);
        assert!(outcome.attempt.answer.contains("api key"));
        assert_eq!(outcome.attempt.citations.len(), 1);

        // one iteration = four ordered step rows
        let steps = store.get_task_steps(&execution.id).unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].phase, StepPhase::Retrieve);
        assert_eq!(steps[3].phase, StepPhase::Reflect);
        assert!(steps.iter().all(|s| s.step_index == 0));

        // memory was upserted with the iteration's learnings
        let memory = store.get_task_agent_state(&execution.id).unwrap().unwrap();
        assert_eq!(memory.current_step, 1);
        assert!(memory.facts.iter().any(|f| f.contains("dashboard")));
        assert!(!memory.visited_sources.is_empty());

        // usage reached the execution row and the run total
        let loaded = store.get_task_execution(&execution.id).unwrap();
        assert!(loaded.tokens_in > 0);
        assert!(store.run_cost(&run.id).unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_step_limit_when_never_done() {
        let config = RunConfig {
            max_steps_per_task: 2,
            ..Default::default()
        };
        let (store, run, task, worker, execution, index) = fixture(config);
        let mock = MockModelClient::new();
        mock.respond("Planning request", plan_json());
        mock.respond("Action request", act_not_done_json());
        mock.respond("Reflection request", reflect_continue_json());
        let agent = agent(&store, mock);

        let outcome = agent.run(&run, &task, &worker, &execution, &index).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::StepLimit);
        assert_eq!(outcome.step_count, 2);
        assert_eq!(store.get_task_steps(&execution.id).unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_reflect_override_forces_continue_on_early_stop() {
        // reflect says stop, act is not done, first iteration: override wins
        let config = RunConfig {
            max_steps_per_task: 2,
            ..Default::default()
        };
        let (store, run, task, worker, execution, index) = fixture(config);
        let mock = MockModelClient::new();
        mock.respond("Planning request", plan_json());
        mock.respond("Action request", act_not_done_json());
        mock.respond(
            "Reflection request",
            r#"{"shouldContinue": false, "summary": "premature stop", "confidence": 0.2}"#,
        );
        let agent = agent(&store, mock);

        let outcome = agent.run(&run, &task, &worker, &execution, &index).await.unwrap();
        // ran to the step limit instead of stopping at iteration one
        assert_eq!(outcome.stop_reason, StopReason::StepLimit);
        assert_eq!(outcome.step_count, 2);

        let steps = store.get_task_steps(&execution.id).unwrap();
        let reflect_steps: Vec<_> = steps.iter().filter(|s| s.phase == StepPhase::Reflect).collect();
        assert!(reflect_steps.iter().all(|s| s.decision.as_ref().is_some_and(|d| d.should_continue)));
    }

    #[tokio::test]
    async fn test_token_limit_stops_promptly() {
        let config = RunConfig {
            max_tokens_per_task: 50,
            ..Default::default()
        };
        let (store, run, task, worker, execution, index) = fixture(config);
        let mock = MockModelClient::new();
        mock.respond("Planning request", plan_json());
        mock.respond("Action request", act_done_json());
        mock.respond("Reflection request", reflect_stop_json());
        let agent = agent(&store, mock);

        let outcome = agent.run(&run, &task, &worker, &execution, &index).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::TokenLimit);
        let loaded = store.get_task_execution(&execution.id).unwrap();
        assert!(loaded.total_tokens() >= 50);
    }

    #[tokio::test]
    async fn test_cancellation_before_first_iteration() {
        let (store, run, task, worker, execution, index) = fixture(RunConfig::default());
        store.update_run_status(&run.id, docmodel::RunStatus::Canceled).unwrap();
        let agent = agent(&store, MockModelClient::new());

        let outcome = agent.run(&run, &task, &worker, &execution, &index).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(outcome.step_count, 0);
    }

    #[test]
    fn test_classify_stop() {
        assert_eq!(classify_stop(None), StopReason::Completed);
        assert_eq!(classify_stop(Some("completed")), StopReason::Completed);
        assert_eq!(classify_stop(Some("goal satisfied")), StopReason::Completed);
        assert_eq!(classify_stop(Some("model error")), StopReason::Error);
        assert_eq!(classify_stop(Some("unable to proceed")), StopReason::Error);
        assert_eq!(classify_stop(Some("blocked on missing docs")), StopReason::Error);
    }

    #[test]
    fn test_looks_unresolved() {
        assert!(looks_unresolved("there is no endpoint documented for this"));
        assert!(looks_unresolved("I was unable to find the page"));
        assert!(!looks_unresolved("the endpoint is documented here"));
    }

    #[test]
    fn test_build_query_includes_memory() {
        let task = Task::new("r", "Authenticate").with_signals(vec!["api key".into()]);
        let mut memory = AgentMemoryState::default();
        memory.absorb_plan(&["read auth".into()], &[]);
        memory.absorb_facts(&["keys rotate monthly".into()]);
        memory.absorb_summary("found the auth page");
        let query = build_query(&task, &memory);
        assert!(query.contains("Authenticate"));
        assert!(query.contains("api key"));
        assert!(query.contains("read auth"));
        assert!(query.contains("keys rotate monthly"));
        assert!(query.contains("found the auth page"));
    }
}
