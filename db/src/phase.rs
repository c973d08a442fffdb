//! Phase executor
//!
//! Runs the baseline phase, then (when enabled and baseline failures exist)
//! regenerates the skill, rebuilds the retrieval index over the re-derived
//! artifact set, and re-runs every task as the optimized phase. Owns the
//! run's successful and canceled finalization paths; fatal errors bubble to
//! the orchestrator's error sink.

use std::sync::Arc;

use docmodel::{
    EvalPhase, EventPayload, Run, RunStatus, RunTotals, SessionStatus, SkillOptimizationSession,
    SkillOrigin, TaskEvaluation, TotalsDelta, event_types,
};
use serde_json::json;
use tracing::{info, warn};

use crate::aggregate::aggregate;
use crate::context::Services;
use crate::lifecycle;
use crate::pool;
use crate::retrieval::RetrievalIndex;
use crate::skill;

async fn emit_phase_started(services: &Services, run_id: &str, phase: EvalPhase) {
    services
        .events
        .emit(
            run_id,
            event_types::PHASE_STARTED,
            EventPayload::new(run_id, format!("{} phase started", phase)).with_phase(phase.to_string()),
        )
        .await;
}

async fn emit_phase_completed(services: &Services, run_id: &str, phase: EvalPhase, totals: &RunTotals) {
    services
        .events
        .emit(
            run_id,
            event_types::PHASE_COMPLETED,
            EventPayload::new(run_id, format!("{} phase completed", phase))
                .with_phase(phase.to_string())
                .with_data(json!({
                    "passedTasks": totals.passed_tasks,
                    "totalTasks": totals.total_tasks,
                    "passRate": totals.pass_rate,
                })),
        )
        .await;
}

/// Finalize a canceled run with whatever partial evaluations exist
async fn finalize_canceled(services: &Services, run_id: &str) -> eyre::Result<()> {
    let optimized = services.store.get_evaluations(run_id, Some(EvalPhase::Optimized))?;
    let evaluations = if optimized.is_empty() {
        services.store.get_evaluations(run_id, Some(EvalPhase::Baseline))?
    } else {
        optimized
    };
    let totals = if evaluations.is_empty() {
        None
    } else {
        Some(aggregate(&evaluations))
    };
    lifecycle::finalize(&services.store, &services.events, run_id, RunStatus::Canceled, totals.as_ref()).await
}

/// Drive both phases to the run's terminal state
pub async fn execute_phases(services: &Services, run: &Run) -> eyre::Result<()> {
    let run_id = &run.id;

    // baseline
    let artifacts = services.store.get_artifacts(run_id)?;
    let index = Arc::new(RetrievalIndex::build(&artifacts));
    emit_phase_started(services, run_id, EvalPhase::Baseline).await;
    pool::run_phase(services, run, EvalPhase::Baseline, index).await?;

    let baseline_evals = services.store.get_evaluations(run_id, Some(EvalPhase::Baseline))?;
    let baseline_totals = aggregate(&baseline_evals);
    emit_phase_completed(services, run_id, EvalPhase::Baseline, &baseline_totals).await;

    if services.store.is_run_canceled(run_id)? {
        return finalize_canceled(services, run_id).await;
    }

    let origin = if artifacts.iter().any(|a| a.is_skill()) {
        SkillOrigin::SiteSkill
    } else {
        SkillOrigin::None
    };
    let mut session = SkillOptimizationSession::new(run_id, origin);
    session.baseline_totals = Some(baseline_totals.clone());

    let failures: Vec<TaskEvaluation> =
        baseline_evals.iter().filter(|e| !e.pass).cloned().collect();

    if !run.config.enable_skill_optimization || failures.is_empty() {
        info!(
            %run_id,
            enabled = run.config.enable_skill_optimization,
            failures = failures.len(),
            "optimization skipped"
        );
        session.status = SessionStatus::Skipped;
        services.store.upsert_optimization_session(&session)?;
        lifecycle::transition(&services.store, &services.events, run_id, RunStatus::Evaluating).await?;
        return lifecycle::finalize(&services.store, &services.events, run_id, RunStatus::Completed, Some(&baseline_totals))
            .await;
    }

    // optimization branch
    session.status = SessionStatus::Running;
    services.store.upsert_optimization_session(&session)?;
    services
        .events
        .emit(
            run_id,
            event_types::SKILL_GENERATION_STARTED,
            EventPayload::new(run_id, "regenerating skill from baseline failures")
                .with_data(json!({"failures": failures.len()})),
        )
        .await;

    let site_skill = artifacts.iter().find(|a| a.is_skill()).map(|a| a.content.clone());
    let generated =
        match skill::generate_optimized_skill(services, run, site_skill.as_deref(), &failures).await {
            Ok(generated) => generated,
            Err(e) => {
                warn!(%run_id, error = %e, "skill generation failed; baseline totals stand");
                session.status = SessionStatus::Error;
                session.error_message = Some(e.to_string());
                services.store.upsert_optimization_session(&session)?;
                services
                    .store
                    .persist_run_error(run_id, "SKILL_OPTIMIZATION_ERROR", &e.to_string())?;
                services
                    .events
                    .emit(
                        run_id,
                        event_types::SKILL_GENERATION_FAILED,
                        EventPayload::new(run_id, "skill generation failed")
                            .with_data(json!({"error": e.to_string()})),
                    )
                    .await;
                lifecycle::transition(&services.store, &services.events, run_id, RunStatus::Evaluating).await?;
                return lifecycle::finalize(
                    &services.store,
                    &services.events,
                    run_id,
                    RunStatus::Completed,
                    Some(&baseline_totals),
                )
                .await;
            }
        };

    let skill_record = skill::optimized_skill_artifact(&generated.markdown);
    services
        .store
        .persist_ingestion_artifacts(run_id, std::slice::from_ref(&skill_record))?;
    services
        .events
        .emit(
            run_id,
            event_types::SKILL_GENERATED,
            EventPayload::new(run_id, "optimized skill generated").with_data(json!({
                "contentHash": skill_record.content_hash,
                "notes": generated.notes,
            })),
        )
        .await;

    // optimized phase over the re-derived artifact set
    let derived = skill::substitute_skill(&artifacts, &generated.markdown, &run.docs_url);
    let optimized_index = Arc::new(RetrievalIndex::build(&derived));
    services.store.reset_task_statuses(run_id)?;
    emit_phase_started(services, run_id, EvalPhase::Optimized).await;
    pool::run_phase(services, run, EvalPhase::Optimized, optimized_index).await?;

    let optimized_evals = services.store.get_evaluations(run_id, Some(EvalPhase::Optimized))?;
    let optimized_totals = aggregate(&optimized_evals);
    emit_phase_completed(services, run_id, EvalPhase::Optimized, &optimized_totals).await;

    if services.store.is_run_canceled(run_id)? {
        session.status = SessionStatus::Error;
        session.error_message = Some("run canceled during optimized phase".to_string());
        services.store.upsert_optimization_session(&session)?;
        return finalize_canceled(services, run_id).await;
    }

    session.status = SessionStatus::Completed;
    session.delta = Some(TotalsDelta::between(&baseline_totals, &optimized_totals));
    session.optimized_totals = Some(optimized_totals.clone());
    services.store.upsert_optimization_session(&session)?;

    lifecycle::transition(&services.store, &services.events, run_id, RunStatus::Evaluating).await?;
    lifecycle::finalize(&services.store, &services.events, run_id, RunStatus::Completed, Some(&optimized_totals)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{FixtureIngestor, Ingestor};
    use crate::llm::MockModelClient;
    use crate::retrieval::snippet_hash;
    use docmodel::{RunConfig, Task, TaskStatus, Worker, WorkerAssignment};
    use docstore::Store;

    const AUTH_TEXT: &str = "Authentication uses an api key sent in the authorization header.";

    fn act_done_json() -> String {
        format!(
            r#"{{"answer": "Send the api key in the authorization header.",
                 "stepOutput": "1. Create an api key. 2. Attach the authorization header.",
                 "citations": [{{"source": "https://d/auth", "snippetHash": "{}", "excerpt": "api key"}}],
                 "done": true}}"#,
            snippet_hash(AUTH_TEXT)
        )
    }

    fn rubric_json(score: f64) -> String {
        format!(
            r#"{{"scores": {{"completeness": {s}, "correctness": {s}, "groundedness": {s}, "actionability": {s}}},
                "rationale": "judged", "confidence": 0.9}}"#,
            s = score
        )
    }

    fn skill_json() -> &'static str {
        "{\"optimizedSkillMarkdown\": \"# Purpose\\nHelp agents.\\n# Retrieval Strategy\\nSearch auth first.\\n# Critical Workflows\\nAuth.\\n# Failure Prevention\\nAlways cite.\\n# Verification Checklist\\nCheck the api key and authorization header.\",
           \"optimizationNotes\": [\"cover authorization header\"]}"
    }

    fn base_mock() -> MockModelClient {
        let mock = MockModelClient::new();
        mock.respond("Planning request", r#"{"planItems": ["read docs"], "rationale": "go"}"#);
        mock.respond("Action request", act_done_json());
        mock.respond(
            "Reflection request",
            r#"{"shouldContinue": false, "summary": "done", "confidence": 0.9, "stopReason": "completed"}"#,
        );
        mock.respond(
            "Evidence alignment request",
            r#"{"isSupportedByEvidence": true, "unsupportedClaims": [], "notes": ""}"#,
        );
        mock
    }

    async fn seeded(config: RunConfig, mock: MockModelClient) -> (Services, Run) {
        let store = Store::open_in_memory().unwrap();
        let services = Services::new(store, std::sync::Arc::new(mock)).unwrap();
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
        let task = Task::new(&run.id, "Authenticate")
            .with_description("Authenticate against the API")
            .with_signals(vec!["api key".into(), "authorization header".into()]);
        services.store.persist_tasks(std::slice::from_ref(&task)).unwrap();
        let worker = Worker::provision(&run.id, "w01", &WorkerAssignment::default());
        services
            .store
            .ensure_run_workers(&run.id, std::slice::from_ref(&worker))
            .unwrap();
        services.store.update_run_status(&run.id, RunStatus::Ingesting).unwrap();
        services
            .store
            .update_run_status(&run.id, RunStatus::GeneratingTasks)
            .unwrap();
        services.store.update_run_status(&run.id, RunStatus::Running).unwrap();
        (services, run)
    }

    fn quiet_config() -> RunConfig {
        RunConfig {
            execution_concurrency: 1,
            judge_concurrency: 1,
            tie_break_enabled: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_optimization_disabled_finalizes_with_baseline() {
        let mock = base_mock();
        mock.respond("Rubric scoring request", rubric_json(4.0));
        let config = RunConfig {
            enable_skill_optimization: false,
            ..quiet_config()
        };
        let (services, run) = seeded(config, mock).await;

        execute_phases(&services, &run).await.unwrap();

        let loaded = services.store.get_run(&run.id).unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        let totals = loaded.totals.unwrap();
        assert_eq!(totals.total_tasks, 1);
        assert_eq!(totals.passed_tasks, 0);

        let session = services.store.get_optimization_session(&run.id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Skipped);
        assert!(session.baseline_totals.is_some());
        assert!(session.optimized_totals.is_none());
    }

    #[tokio::test]
    async fn test_no_failures_skips_optimization() {
        let mock = base_mock();
        mock.respond("Rubric scoring request", rubric_json(9.0));
        let config = RunConfig {
            enable_skill_optimization: true,
            ..quiet_config()
        };
        let (services, run) = seeded(config, mock).await;

        execute_phases(&services, &run).await.unwrap();

        let session = services.store.get_optimization_session(&run.id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Skipped);
        // only baseline evaluations exist
        assert!(
            services
                .store
                .get_evaluations(&run.id, Some(EvalPhase::Optimized))
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_optimization_uplift_sets_delta_and_optimized_totals() {
        let mock = base_mock();
        // baseline rubric fails, optimized rubric passes
        mock.respond_seq(
            "Rubric scoring request",
            vec![rubric_json(4.0), rubric_json(9.0)],
        );
        mock.respond("Skill regeneration request", skill_json());
        let config = RunConfig {
            enable_skill_optimization: true,
            ..quiet_config()
        };
        let (services, run) = seeded(config, mock).await;

        execute_phases(&services, &run).await.unwrap();

        let session = services.store.get_optimization_session(&run.id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let delta = session.delta.unwrap();
        assert_eq!(delta.passed_tasks_delta, 1);
        assert_eq!(delta.pass_rate_delta, 1.0);

        // run totals are the optimized totals
        let loaded = services.store.get_run(&run.id).unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.totals.unwrap().passed_tasks, 1);

        // the generated skill was persisted and is retrievable
        let artifacts = services.store.get_artifacts(&run.id).unwrap();
        assert!(
            artifacts
                .iter()
                .any(|a| a.artifact_type == docmodel::ArtifactType::OptimizedSkill)
        );

        // both phases left evaluation rows, task status reset in between
        assert_eq!(
            services
                .store
                .get_evaluations(&run.id, Some(EvalPhase::Baseline))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            services
                .store
                .get_evaluations(&run.id, Some(EvalPhase::Optimized))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            services.store.get_tasks(&run.id).unwrap()[0].status,
            TaskStatus::Passed
        );
    }

    #[tokio::test]
    async fn test_skill_generation_failure_falls_back_to_baseline() {
        let mock = base_mock();
        mock.respond("Rubric scoring request", rubric_json(4.0));
        // no "Skill regeneration request" rule: the call errors
        let config = RunConfig {
            enable_skill_optimization: true,
            ..quiet_config()
        };
        let (services, run) = seeded(config, mock).await;

        execute_phases(&services, &run).await.unwrap();

        let session = services.store.get_optimization_session(&run.id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.error_message.is_some());

        let loaded = services.store.get_run(&run.id).unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.totals.unwrap().passed_tasks, 0);

        let errors = services.store.get_run_errors(&run.id).unwrap();
        assert!(errors.iter().any(|e| e.code == "SKILL_OPTIMIZATION_ERROR"));

        let events = services.store.get_run_events_after(&run.id, 0, 500).unwrap();
        assert!(events.iter().any(|e| e.event_type == "skill.generation.failed"));
        assert_eq!(events.last().unwrap().event_type, "run.completed");
    }

    #[tokio::test]
    async fn test_site_skill_origin_recorded() {
        let mock = base_mock();
        mock.respond("Rubric scoring request", rubric_json(9.0));
        let config = RunConfig {
            enable_skill_optimization: true,
            ..quiet_config()
        };
        let store = Store::open_in_memory().unwrap();
        let services = Services::new(store, std::sync::Arc::new(mock)).unwrap();
        let run = Run::new("https://docs.example.com", config);
        services.store.create_run(&run).unwrap();
        let outcome = FixtureIngestor::new()
            .with_page("https://d/auth", AUTH_TEXT)
            .with_skill("# Skill\nRead auth first.")
            .ingest(&run.docs_url)
            .await
            .unwrap();
        services
            .store
            .persist_ingestion_artifacts(&run.id, &outcome.artifacts)
            .unwrap();
        let task = Task::new(&run.id, "Authenticate").with_signals(vec!["api key".into()]);
        services.store.persist_tasks(std::slice::from_ref(&task)).unwrap();
        let worker = Worker::provision(&run.id, "w01", &WorkerAssignment::default());
        services
            .store
            .ensure_run_workers(&run.id, std::slice::from_ref(&worker))
            .unwrap();
        for status in [RunStatus::Ingesting, RunStatus::GeneratingTasks, RunStatus::Running] {
            services.store.update_run_status(&run.id, status).unwrap();
        }

        execute_phases(&services, &run).await.unwrap();

        let session = services.store.get_optimization_session(&run.id).unwrap().unwrap();
        assert_eq!(session.source_skill_origin, SkillOrigin::SiteSkill);
    }
}
