//! Store handle and primitives
//!
//! Thin typed layer over SQLite. Callers pass and receive domain values;
//! JSON encode/decode happens only at this boundary.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use docmodel::{
    AgentMemoryState, Artifact, ArtifactType, CriterionScores, DeterministicCheckResult,
    EvalPhase, EventPayload, ExecutionStatus, FailureClass, ModelOverrides, Run, RunEvent,
    RunStatus, RunTotals, SessionStatus, SkillOptimizationSession, SkillOrigin, StepCitation,
    StepPhase, StepTrace, StopReason, Task, TaskEvaluation, TaskExecution, TaskStatus, Worker,
    WorkerStatus, now_ms,
};

use crate::error::{StoreError, StoreResult, is_constraint_violation};
use crate::schema::SCHEMA;

/// A persisted run-level error entry
#[derive(Debug, Clone)]
pub struct RunErrorRecord {
    pub run_id: String,
    pub code: String,
    pub message: String,
    pub created_at: i64,
}

/// Shared store handle
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn invalid<T>(field: &'static str, value: &str) -> StoreResult<T> {
    Err(StoreError::InvalidColumn {
        field,
        value: value.to_string(),
    })
}

impl Store {
    /// Open (and migrate) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Store::open");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Sqlite(rusqlite::Error::InvalidPath(e.to_string().into()))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests and demos
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        info!("store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject execution/step writes once the owning run is terminal
    fn assert_run_writable(conn: &Connection, run_id: &str) -> StoreResult<()> {
        let status: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(status) = status else {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        };
        match RunStatus::parse(&status) {
            Some(s) if s.is_terminal() => Err(StoreError::RunTerminal(run_id.to_string())),
            Some(_) => Ok(()),
            None => invalid("runs.status", &status),
        }
    }

    // === Runs ===

    pub fn create_run(&self, run: &Run) -> StoreResult<()> {
        debug!(run_id = %run.id, docs_url = %run.docs_url, "create_run");
        let conn = self.lock();
        conn.execute(
            "INSERT INTO runs (id, docsUrl, status, startedAt, endedAt, config, totals, costEstimate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id,
                run.docs_url,
                run.status.to_string(),
                run.started_at,
                run.ended_at,
                serde_json::to_string(&run.config)?,
                run.totals.as_ref().map(serde_json::to_string).transpose()?,
                run.cost_estimate,
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> StoreResult<Run> {
        let conn = self.lock();
        Self::get_run_locked(&conn, run_id)
    }

    fn get_run_locked(conn: &Connection, run_id: &str) -> StoreResult<Run> {
        let row = conn
            .query_row(
                "SELECT id, docsUrl, status, startedAt, endedAt, config, totals, costEstimate
                 FROM runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, f64>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, docs_url, status, started_at, ended_at, config, totals, cost_estimate)) = row
        else {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        };
        let Some(status) = RunStatus::parse(&status) else {
            return invalid("runs.status", &status);
        };
        Ok(Run {
            id,
            docs_url,
            status,
            started_at,
            ended_at,
            config: serde_json::from_str(&config)?,
            totals: totals.as_deref().map(serde_json::from_str).transpose()?,
            cost_estimate,
        })
    }

    pub fn list_runs(&self) -> StoreResult<Vec<Run>> {
        let conn = self.lock();
        let ids: Vec<String> = conn
            .prepare("SELECT id FROM runs ORDER BY startedAt DESC")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        ids.iter()
            .map(|id| Self::get_run_locked(&conn, id))
            .collect()
    }

    /// Lightweight status read for cancellation/budget polls
    pub fn run_status(&self, run_id: &str) -> StoreResult<RunStatus> {
        let conn = self.lock();
        let status: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(status) = status else {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        };
        RunStatus::parse(&status).map_or_else(|| invalid("runs.status", &status), Ok)
    }

    /// Lightweight accumulated-cost read
    pub fn run_cost(&self, run_id: &str) -> StoreResult<f64> {
        let conn = self.lock();
        conn.query_row(
            "SELECT costEstimate FROM runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    pub fn is_run_canceled(&self, run_id: &str) -> StoreResult<bool> {
        Ok(self.run_status(run_id)? == RunStatus::Canceled)
    }

    /// Write a lifecycle status. No-op returning the current status when the
    /// run is already terminal; the finalizer is the only writer of terminal
    /// rewrites and goes through `finalize_run`.
    pub fn update_run_status(&self, run_id: &str, status: RunStatus) -> StoreResult<RunStatus> {
        debug!(%run_id, %status, "update_run_status");
        let conn = self.lock();
        let current = {
            let raw: Option<String> = conn
                .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(raw) = raw else {
                return Err(StoreError::RunNotFound(run_id.to_string()));
            };
            RunStatus::parse(&raw).map_or_else(|| invalid("runs.status", &raw), Ok)?
        };
        if current.is_terminal() {
            debug!(%run_id, %current, "update_run_status: terminal, no-op");
            return Ok(current);
        }
        conn.execute(
            "UPDATE runs SET status = ?1 WHERE id = ?2",
            params![status.to_string(), run_id],
        )?;
        Ok(status)
    }

    /// Authoritative terminal write: status, totals, endedAt, and every
    /// non-terminal worker flipped to done, in one transaction.
    pub fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        totals: Option<&RunTotals>,
    ) -> StoreResult<()> {
        debug!(%run_id, %status, has_totals = totals.is_some(), "finalize_run");
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE runs SET status = ?1, totals = ?2, endedAt = ?3 WHERE id = ?4",
            params![
                status.to_string(),
                totals.map(serde_json::to_string).transpose()?,
                now_ms(),
                run_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        tx.execute(
            "UPDATE workers SET status = 'done' WHERE runId = ?1 AND status NOT IN ('done', 'error')",
            params![run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Atomic cost accumulation; returns the new run total
    pub fn increment_run_cost(&self, run_id: &str, delta: f64) -> StoreResult<f64> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE runs SET costEstimate = costEstimate + ?1 WHERE id = ?2",
            params![delta, run_id],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(conn.query_row(
            "SELECT costEstimate FROM runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )?)
    }

    // === Ingestion artifacts ===

    pub fn persist_ingestion_artifacts(
        &self,
        run_id: &str,
        artifacts: &[Artifact],
    ) -> StoreResult<()> {
        debug!(%run_id, count = artifacts.len(), "persist_ingestion_artifacts");
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for artifact in artifacts {
            tx.execute(
                "INSERT INTO ingestion_artifacts
                 (runId, artifactType, sourceUrl, content, contentHash, metadata, createdAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    artifact.artifact_type.to_string(),
                    artifact.source_url,
                    artifact.content,
                    artifact.content_hash,
                    artifact.metadata.as_ref().map(serde_json::to_string).transpose()?,
                    now_ms(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_artifacts(&self, run_id: &str) -> StoreResult<Vec<Artifact>> {
        let conn = self.lock();
        let rows: Vec<(String, String, String, String, Option<String>)> = conn
            .prepare(
                "SELECT artifactType, sourceUrl, content, contentHash, metadata
                 FROM ingestion_artifacts WHERE runId = ?1 ORDER BY id",
            )?
            .query_map(params![run_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(|(artifact_type, source_url, content, content_hash, metadata)| {
                let Some(artifact_type) = ArtifactType::parse(&artifact_type) else {
                    return invalid("ingestion_artifacts.artifactType", &artifact_type);
                };
                Ok(Artifact {
                    artifact_type,
                    source_url,
                    content,
                    content_hash,
                    metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
                })
            })
            .collect()
    }

    // === Tasks ===

    pub fn persist_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        debug!(count = tasks.len(), "persist_tasks");
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for task in tasks {
            tx.execute(
                "INSERT INTO tasks
                 (taskId, runId, name, description, category, difficulty, expectedSignals, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.task_id,
                    task.run_id,
                    task.name,
                    task.description,
                    task.category,
                    task.difficulty,
                    serde_json::to_string(&task.expected_signals)?,
                    task.status.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_tasks(&self, run_id: &str) -> StoreResult<Vec<Task>> {
        let conn = self.lock();
        let rows: Vec<(String, String, String, String, String, String, String, String)> = conn
            .prepare(
                "SELECT taskId, runId, name, description, category, difficulty, expectedSignals, status
                 FROM tasks WHERE runId = ?1 ORDER BY rowid",
            )?
            .query_map(params![run_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(
                |(task_id, run_id, name, description, category, difficulty, signals, status)| {
                    let Some(status) = TaskStatus::parse(&status) else {
                        return invalid("tasks.status", &status);
                    };
                    Ok(Task {
                        task_id,
                        run_id,
                        name,
                        description,
                        category,
                        difficulty,
                        expected_signals: serde_json::from_str(&signals)?,
                        status,
                    })
                },
            )
            .collect()
    }

    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> StoreResult<()> {
        debug!(%task_id, %status, "update_task_status");
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE taskId = ?2",
            params![status.to_string(), task_id],
        )?;
        Ok(())
    }

    /// Reset every task to pending; the optimized phase re-runs all tasks
    pub fn reset_task_statuses(&self, run_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET status = 'pending' WHERE runId = ?1",
            params![run_id],
        )?;
        Ok(())
    }

    // === Workers ===

    /// Idempotent provisioning: if workers already exist for the run, the
    /// existing set is returned and the argument is ignored.
    pub fn ensure_run_workers(&self, run_id: &str, workers: &[Worker]) -> StoreResult<Vec<Worker>> {
        debug!(%run_id, count = workers.len(), "ensure_run_workers");
        {
            let existing = self.get_workers(run_id)?;
            if !existing.is_empty() {
                debug!(%run_id, existing = existing.len(), "ensure_run_workers: reusing");
                return Ok(existing);
            }
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for worker in workers {
            tx.execute(
                "INSERT INTO workers (id, runId, workerLabel, modelProvider, modelName, modelConfig, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    worker.id,
                    worker.run_id,
                    worker.worker_label,
                    worker.model_provider,
                    worker.model_name,
                    serde_json::to_string(&worker.model_config)?,
                    worker.status.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        drop(conn);
        self.get_workers(run_id)
    }

    pub fn get_workers(&self, run_id: &str) -> StoreResult<Vec<Worker>> {
        let conn = self.lock();
        let rows: Vec<(String, String, String, String, String, String, String)> = conn
            .prepare(
                "SELECT id, runId, workerLabel, modelProvider, modelName, modelConfig, status
                 FROM workers WHERE runId = ?1 ORDER BY workerLabel",
            )?
            .query_map(params![run_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(
                |(id, run_id, worker_label, model_provider, model_name, model_config, status)| {
                    let Some(status) = WorkerStatus::parse(&status) else {
                        return invalid("workers.status", &status);
                    };
                    let model_config: ModelOverrides = serde_json::from_str(&model_config)?;
                    Ok(Worker {
                        id,
                        run_id,
                        worker_label,
                        model_provider,
                        model_name,
                        model_config,
                        status,
                    })
                },
            )
            .collect()
    }

    pub fn update_worker_status(&self, worker_id: &str, status: WorkerStatus) -> StoreResult<()> {
        debug!(%worker_id, %status, "update_worker_status");
        let conn = self.lock();
        conn.execute(
            "UPDATE workers SET status = ?1 WHERE id = ?2",
            params![status.to_string(), worker_id],
        )?;
        Ok(())
    }

    // === Task executions ===

    pub fn create_task_execution(&self, execution: &TaskExecution) -> StoreResult<()> {
        debug!(exec_id = %execution.id, task_id = %execution.task_id, phase = %execution.phase, "create_task_execution");
        let conn = self.lock();
        Self::assert_run_writable(&conn, &execution.run_id)?;
        conn.execute(
            "INSERT INTO task_executions
             (id, runId, taskId, workerId, phase, status, stepCount, tokensIn, tokensOut,
              costEstimate, stopReason, startedAt, endedAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                execution.id,
                execution.run_id,
                execution.task_id,
                execution.worker_id,
                execution.phase.to_string(),
                execution.status.to_string(),
                execution.step_count,
                execution.tokens_in as i64,
                execution.tokens_out as i64,
                execution.cost_estimate,
                execution.stop_reason.map(|r| r.to_string()),
                execution.started_at,
                execution.ended_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_task_execution(&self, exec_id: &str) -> StoreResult<TaskExecution> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, runId, taskId, workerId, phase, status, stepCount, tokensIn, tokensOut,
                        costEstimate, stopReason, startedAt, endedAt
                 FROM task_executions WHERE id = ?1",
                params![exec_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, f64>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, i64>(11)?,
                        row.get::<_, Option<i64>>(12)?,
                    ))
                },
            )
            .optional()?;
        let Some((
            id,
            run_id,
            task_id,
            worker_id,
            phase,
            status,
            step_count,
            tokens_in,
            tokens_out,
            cost_estimate,
            stop_reason,
            started_at,
            ended_at,
        )) = row
        else {
            return Err(StoreError::ExecutionNotFound(exec_id.to_string()));
        };
        let Some(phase) = EvalPhase::parse(&phase) else {
            return invalid("task_executions.phase", &phase);
        };
        let Some(status) = ExecutionStatus::parse(&status) else {
            return invalid("task_executions.status", &status);
        };
        let stop_reason = match stop_reason {
            Some(raw) => match StopReason::parse(&raw) {
                Some(reason) => Some(reason),
                None => return invalid("task_executions.stopReason", &raw),
            },
            None => None,
        };
        Ok(TaskExecution {
            id,
            run_id,
            task_id,
            worker_id,
            phase,
            status,
            step_count,
            tokens_in: tokens_in as u64,
            tokens_out: tokens_out as u64,
            cost_estimate,
            stop_reason,
            started_at,
            ended_at,
        })
    }

    pub fn list_task_executions(&self, run_id: &str) -> StoreResult<Vec<TaskExecution>> {
        let ids: Vec<String> = {
            let conn = self.lock();
            conn.prepare("SELECT id FROM task_executions WHERE runId = ?1 ORDER BY rowid")?
                .query_map(params![run_id], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| self.get_task_execution(id)).collect()
    }

    /// Sum of per-execution cost estimates, for reconciliation checks
    pub fn sum_execution_cost(&self, run_id: &str) -> StoreResult<f64> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(costEstimate), 0) FROM task_executions WHERE runId = ?1",
            params![run_id],
            |row| row.get(0),
        )?)
    }

    pub fn update_task_execution_progress(
        &self,
        exec_id: &str,
        step_count: u32,
        tokens_in: u64,
        tokens_out: u64,
        cost_estimate: f64,
    ) -> StoreResult<()> {
        let conn = self.lock();
        let run_id: Option<String> = conn
            .query_row(
                "SELECT runId FROM task_executions WHERE id = ?1",
                params![exec_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(run_id) = run_id else {
            return Err(StoreError::ExecutionNotFound(exec_id.to_string()));
        };
        Self::assert_run_writable(&conn, &run_id)?;
        conn.execute(
            "UPDATE task_executions
             SET stepCount = ?1, tokensIn = ?2, tokensOut = ?3, costEstimate = ?4
             WHERE id = ?5",
            params![step_count, tokens_in as i64, tokens_out as i64, cost_estimate, exec_id],
        )?;
        Ok(())
    }

    pub fn finalize_task_execution(
        &self,
        exec_id: &str,
        status: ExecutionStatus,
        stop_reason: Option<StopReason>,
    ) -> StoreResult<()> {
        debug!(%exec_id, %status, ?stop_reason, "finalize_task_execution");
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE task_executions SET status = ?1, stopReason = ?2, endedAt = ?3 WHERE id = ?4",
            params![
                status.to_string(),
                stop_reason.map(|r| r.to_string()),
                now_ms(),
                exec_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::ExecutionNotFound(exec_id.to_string()));
        }
        Ok(())
    }

    // === Agent memory ===

    pub fn upsert_task_agent_state(
        &self,
        exec_id: &str,
        run_id: &str,
        state: &AgentMemoryState,
    ) -> StoreResult<()> {
        let conn = self.lock();
        Self::assert_run_writable(&conn, run_id)?;
        conn.execute(
            "INSERT INTO task_agent_state (taskExecutionId, runId, state, updatedAt)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(taskExecutionId)
             DO UPDATE SET state = excluded.state, updatedAt = excluded.updatedAt",
            params![exec_id, run_id, serde_json::to_string(state)?, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_task_agent_state(&self, exec_id: &str) -> StoreResult<Option<AgentMemoryState>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM task_agent_state WHERE taskExecutionId = ?1",
                params![exec_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(Into::into)
    }

    // === Step traces ===

    /// Persist one step; returns the store-assigned insertion id
    pub fn persist_task_step(&self, run_id: &str, step: &StepTrace) -> StoreResult<i64> {
        let conn = self.lock();
        Self::assert_run_writable(&conn, run_id)?;
        conn.execute(
            "INSERT INTO task_steps
             (taskExecutionId, runId, stepIndex, phase, input, output, retrieval, usage, decision, createdAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                step.task_execution_id,
                run_id,
                step.step_index,
                step.phase.to_string(),
                serde_json::to_string(&step.input)?,
                serde_json::to_string(&step.output)?,
                step.retrieval.as_ref().map(serde_json::to_string).transpose()?,
                step.usage.as_ref().map(serde_json::to_string).transpose()?,
                step.decision.as_ref().map(serde_json::to_string).transpose()?,
                step.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task_steps(&self, exec_id: &str) -> StoreResult<Vec<StepTrace>> {
        let conn = self.lock();
        type RawStep = (
            i64,
            String,
            u32,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            i64,
        );
        let rows: Vec<RawStep> = conn
            .prepare(
                "SELECT id, taskExecutionId, stepIndex, phase, input, output, retrieval, usage, decision, createdAt
                 FROM task_steps WHERE taskExecutionId = ?1 ORDER BY id",
            )?
            .query_map(params![exec_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(
                |(id, task_execution_id, step_index, phase, input, output, retrieval, usage, decision, created_at)| {
                    let Some(phase) = StepPhase::parse(&phase) else {
                        return invalid("task_steps.phase", &phase);
                    };
                    Ok(StepTrace {
                        id,
                        task_execution_id,
                        step_index,
                        phase,
                        input: serde_json::from_str(&input)?,
                        output: serde_json::from_str(&output)?,
                        retrieval: retrieval.as_deref().map(serde_json::from_str).transpose()?,
                        usage: usage.as_deref().map(serde_json::from_str).transpose()?,
                        decision: decision.as_deref().map(serde_json::from_str).transpose()?,
                        created_at,
                    })
                },
            )
            .collect()
    }

    pub fn count_task_steps(&self, run_id: &str) -> StoreResult<u64> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM task_steps WHERE runId = ?1",
            params![run_id],
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    pub fn persist_task_step_citations(
        &self,
        run_id: &str,
        step_id: i64,
        citations: &[StepCitation],
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        Self::assert_run_writable(&conn, run_id)?;
        let tx = conn.transaction()?;
        for citation in citations {
            tx.execute(
                "INSERT INTO step_citations
                 (stepId, runId, source, snippetHash, excerpt, startOffset, endOffset)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    step_id,
                    run_id,
                    citation.source,
                    citation.snippet_hash,
                    citation.excerpt,
                    citation.start_offset,
                    citation.end_offset,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_step_citations(&self, step_id: i64) -> StoreResult<Vec<StepCitation>> {
        let conn = self.lock();
        let rows = conn
            .prepare(
                "SELECT stepId, source, snippetHash, excerpt, startOffset, endOffset
                 FROM step_citations WHERE stepId = ?1 ORDER BY id",
            )?
            .query_map(params![step_id], |row| {
                Ok(StepCitation {
                    step_id: row.get(0)?,
                    source: row.get(1)?,
                    snippet_hash: row.get(2)?,
                    excerpt: row.get(3)?,
                    start_offset: row.get(4)?,
                    end_offset: row.get(5)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    // === Deterministic checks, attempts, evaluations ===

    pub fn persist_deterministic_checks(
        &self,
        run_id: &str,
        checks: &[DeterministicCheckResult],
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        Self::assert_run_writable(&conn, run_id)?;
        let tx = conn.transaction()?;
        for check in checks {
            tx.execute(
                "INSERT INTO deterministic_checks
                 (taskExecutionId, runId, name, passed, scoreDelta, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    check.task_execution_id,
                    run_id,
                    check.name,
                    check.passed,
                    check.score_delta,
                    check.details.as_ref().map(serde_json::to_string).transpose()?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_deterministic_checks(
        &self,
        exec_id: &str,
    ) -> StoreResult<Vec<DeterministicCheckResult>> {
        let conn = self.lock();
        let rows: Vec<(String, String, bool, f64, Option<String>)> = conn
            .prepare(
                "SELECT taskExecutionId, name, passed, scoreDelta, details
                 FROM deterministic_checks WHERE taskExecutionId = ?1 ORDER BY id",
            )?
            .query_map(params![exec_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(|(task_execution_id, name, passed, score_delta, details)| {
                Ok(DeterministicCheckResult {
                    task_execution_id,
                    name,
                    passed,
                    score_delta,
                    details: details.as_deref().map(serde_json::from_str).transpose()?,
                })
            })
            .collect()
    }

    pub fn persist_task_attempt(
        &self,
        run_id: &str,
        exec_id: &str,
        task_id: &str,
        phase: EvalPhase,
        answer: &str,
        steps: &[String],
    ) -> StoreResult<()> {
        let conn = self.lock();
        Self::assert_run_writable(&conn, run_id)?;
        conn.execute(
            "INSERT INTO task_attempts (taskExecutionId, runId, taskId, phase, answer, steps, createdAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                exec_id,
                run_id,
                task_id,
                phase.to_string(),
                answer,
                serde_json::to_string(steps)?,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn persist_task_evaluation(&self, evaluation: &TaskEvaluation) -> StoreResult<()> {
        debug!(task_id = %evaluation.task_id, phase = %evaluation.phase, pass = evaluation.pass, "persist_task_evaluation");
        let conn = self.lock();
        conn.execute(
            "INSERT INTO task_evaluations
             (runId, taskId, phase, criterionScores, pass, qualityPass, validityPass,
              validityBlockedReasons, failureClass, rationale, judgeModel, confidence, createdAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                evaluation.run_id,
                evaluation.task_id,
                evaluation.phase.to_string(),
                serde_json::to_string(&evaluation.criterion_scores)?,
                evaluation.pass,
                evaluation.quality_pass,
                evaluation.validity_pass,
                serde_json::to_string(&evaluation.validity_blocked_reasons)?,
                evaluation.failure_class.map(|c| c.to_string()),
                evaluation.rationale,
                evaluation.judge_model,
                evaluation.confidence,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_evaluations(
        &self,
        run_id: &str,
        phase: Option<EvalPhase>,
    ) -> StoreResult<Vec<TaskEvaluation>> {
        let conn = self.lock();
        type RawEval = (
            String,
            String,
            String,
            String,
            bool,
            bool,
            bool,
            String,
            Option<String>,
            String,
            String,
            f64,
        );
        let sql = "SELECT runId, taskId, phase, criterionScores, pass, qualityPass, validityPass,
                          validityBlockedReasons, failureClass, rationale, judgeModel, confidence
                   FROM task_evaluations WHERE runId = ?1 AND (?2 IS NULL OR phase = ?2)
                   ORDER BY id";
        let rows: Vec<RawEval> = conn
            .prepare(sql)?
            .query_map(params![run_id, phase.map(|p| p.to_string())], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(
                |(
                    run_id,
                    task_id,
                    phase,
                    scores,
                    pass,
                    quality_pass,
                    validity_pass,
                    blocked,
                    failure_class,
                    rationale,
                    judge_model,
                    confidence,
                )| {
                    let Some(phase) = EvalPhase::parse(&phase) else {
                        return invalid("task_evaluations.phase", &phase);
                    };
                    let failure_class = match failure_class {
                        Some(raw) => match FailureClass::parse(&raw) {
                            Some(class) => Some(class),
                            None => return invalid("task_evaluations.failureClass", &raw),
                        },
                        None => None,
                    };
                    let criterion_scores: CriterionScores = serde_json::from_str(&scores)?;
                    Ok(TaskEvaluation {
                        run_id,
                        task_id,
                        phase,
                        criterion_scores,
                        pass,
                        quality_pass,
                        validity_pass,
                        validity_blocked_reasons: serde_json::from_str(&blocked)?,
                        failure_class,
                        rationale,
                        judge_model,
                        confidence,
                    })
                },
            )
            .collect()
    }

    // === Run events ===

    /// Insert an event at an exact sequence slot. Unique-constraint races
    /// surface as [`StoreError::SeqConflict`] for the caller's retry loop.
    pub fn append_run_event_at(
        &self,
        run_id: &str,
        seq: i64,
        event_type: &str,
        payload: &EventPayload,
    ) -> StoreResult<i64> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO run_events (runId, seq, eventType, payload, createdAt)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, seq, event_type, serde_json::to_string(payload)?, now_ms()],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::SeqConflict {
                run_id: run_id.to_string(),
                seq,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Next free sequence slot for a run (max + 1, 1-based)
    pub fn next_event_seq(&self, run_id: &str) -> StoreResult<i64> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE runId = ?1",
            params![run_id],
            |row| row.get(0),
        )?)
    }

    /// Cursored read: events with id strictly greater than `after_id`
    pub fn get_run_events_after(
        &self,
        run_id: &str,
        after_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<RunEvent>> {
        let conn = self.lock();
        let rows: Vec<(i64, String, i64, String, String, i64)> = conn
            .prepare(
                "SELECT id, runId, seq, eventType, payload, createdAt
                 FROM run_events WHERE runId = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
            )?
            .query_map(params![run_id, after_id, limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(|(id, run_id, seq, event_type, payload, created_at)| {
                Ok(RunEvent {
                    id,
                    run_id,
                    seq,
                    event_type,
                    payload: serde_json::from_str(&payload)?,
                    created_at,
                })
            })
            .collect()
    }

    // === Run errors ===

    pub fn persist_run_error(&self, run_id: &str, code: &str, message: &str) -> StoreResult<()> {
        debug!(%run_id, %code, "persist_run_error");
        let conn = self.lock();
        conn.execute(
            "INSERT INTO run_errors (runId, code, message, createdAt) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, code, message, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_run_errors(&self, run_id: &str) -> StoreResult<Vec<RunErrorRecord>> {
        let conn = self.lock();
        let rows = conn
            .prepare(
                "SELECT runId, code, message, createdAt FROM run_errors WHERE runId = ?1 ORDER BY id",
            )?
            .query_map(params![run_id], |row| {
                Ok(RunErrorRecord {
                    run_id: row.get(0)?,
                    code: row.get(1)?,
                    message: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    // === Skill optimization sessions ===

    pub fn upsert_optimization_session(
        &self,
        session: &SkillOptimizationSession,
    ) -> StoreResult<()> {
        debug!(run_id = %session.run_id, status = %session.status, "upsert_optimization_session");
        let conn = self.lock();
        conn.execute(
            "INSERT INTO skill_optimization_sessions
             (runId, status, sourceSkillOrigin, baselineTotals, optimizedTotals, delta, errorMessage, updatedAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(runId) DO UPDATE SET
                status = excluded.status,
                sourceSkillOrigin = excluded.sourceSkillOrigin,
                baselineTotals = excluded.baselineTotals,
                optimizedTotals = excluded.optimizedTotals,
                delta = excluded.delta,
                errorMessage = excluded.errorMessage,
                updatedAt = excluded.updatedAt",
            params![
                session.run_id,
                session.status.to_string(),
                session.source_skill_origin.to_string(),
                session.baseline_totals.as_ref().map(serde_json::to_string).transpose()?,
                session.optimized_totals.as_ref().map(serde_json::to_string).transpose()?,
                session.delta.as_ref().map(serde_json::to_string).transpose()?,
                session.error_message,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_optimization_session(
        &self,
        run_id: &str,
    ) -> StoreResult<Option<SkillOptimizationSession>> {
        let conn = self.lock();
        type RawSession = (String, String, String, Option<String>, Option<String>, Option<String>, Option<String>);
        let row: Option<RawSession> = conn
            .query_row(
                "SELECT runId, status, sourceSkillOrigin, baselineTotals, optimizedTotals, delta, errorMessage
                 FROM skill_optimization_sessions WHERE runId = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((run_id, status, origin, baseline, optimized, delta, error_message)) = row else {
            return Ok(None);
        };
        let Some(status) = SessionStatus::parse(&status) else {
            return invalid("skill_optimization_sessions.status", &status);
        };
        let Some(source_skill_origin) = SkillOrigin::parse(&origin) else {
            return invalid("skill_optimization_sessions.sourceSkillOrigin", &origin);
        };
        Ok(Some(SkillOptimizationSession {
            run_id,
            status,
            source_skill_origin,
            baseline_totals: baseline.as_deref().map(serde_json::from_str).transpose()?,
            optimized_totals: optimized.as_deref().map(serde_json::from_str).transpose()?,
            delta: delta.as_deref().map(serde_json::from_str).transpose()?,
            error_message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel::RunConfig;

    fn test_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn seeded_run(store: &Store) -> Run {
        let run = Run::new("https://docs.example.com", RunConfig::default());
        store.create_run(&run).unwrap();
        run
    }

    #[test]
    fn test_create_and_get_run() {
        let store = test_store();
        let run = seeded_run(&store);
        let loaded = store.get_run(&run.id).unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.status, RunStatus::Queued);
        assert_eq!(loaded.config.max_tasks, run.config.max_tasks);
        assert_eq!(loaded.cost_estimate, 0.0);
    }

    #[test]
    fn test_get_run_missing() {
        let store = test_store();
        assert!(matches!(
            store.get_run("nope"),
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[test]
    fn test_update_run_status_noop_when_terminal() {
        let store = test_store();
        let run = seeded_run(&store);
        store.finalize_run(&run.id, RunStatus::Canceled, None).unwrap();
        let effective = store.update_run_status(&run.id, RunStatus::Running).unwrap();
        assert_eq!(effective, RunStatus::Canceled);
        assert_eq!(store.run_status(&run.id).unwrap(), RunStatus::Canceled);
    }

    #[test]
    fn test_increment_run_cost_accumulates() {
        let store = test_store();
        let run = seeded_run(&store);
        store.increment_run_cost(&run.id, 0.25).unwrap();
        let total = store.increment_run_cost(&run.id, 0.5).unwrap();
        assert!((total - 0.75).abs() < 1e-9);
        assert!((store.run_cost(&run.id).unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_finalize_run_flips_workers_to_done() {
        let store = test_store();
        let run = seeded_run(&store);
        let assignment = docmodel::WorkerAssignment::default();
        let workers = vec![
            Worker::provision(&run.id, "w01", &assignment),
            Worker::provision(&run.id, "w02", &assignment),
        ];
        store.ensure_run_workers(&run.id, &workers).unwrap();
        store
            .update_worker_status(&workers[0].id, WorkerStatus::Running)
            .unwrap();
        store
            .finalize_run(&run.id, RunStatus::Completed, Some(&RunTotals::default()))
            .unwrap();
        let reloaded = store.get_workers(&run.id).unwrap();
        assert!(reloaded.iter().all(|w| w.status == WorkerStatus::Done));
        let run = store.get_run(&run.id).unwrap();
        assert!(run.totals.is_some());
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_ensure_run_workers_idempotent() {
        let store = test_store();
        let run = seeded_run(&store);
        let assignment = docmodel::WorkerAssignment::default();
        let first = store
            .ensure_run_workers(&run.id, &[Worker::provision(&run.id, "w01", &assignment)])
            .unwrap();
        let second = store
            .ensure_run_workers(
                &run.id,
                &[
                    Worker::provision(&run.id, "w01", &assignment),
                    Worker::provision(&run.id, "w02", &assignment),
                ],
            )
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_terminal_run_rejects_execution_writes() {
        let store = test_store();
        let run = seeded_run(&store);
        let exec = TaskExecution::new(&run.id, "task-1", "worker-1", EvalPhase::Baseline);
        store.create_task_execution(&exec).unwrap();
        store.finalize_run(&run.id, RunStatus::Completed, None).unwrap();

        let another = TaskExecution::new(&run.id, "task-2", "worker-1", EvalPhase::Baseline);
        assert!(matches!(
            store.create_task_execution(&another),
            Err(StoreError::RunTerminal(_))
        ));
        assert!(matches!(
            store.update_task_execution_progress(&exec.id, 1, 10, 10, 0.01),
            Err(StoreError::RunTerminal(_))
        ));
        let step = StepTrace::new(&exec.id, 0, StepPhase::Retrieve);
        assert!(matches!(
            store.persist_task_step(&run.id, &step),
            Err(StoreError::RunTerminal(_))
        ));
    }

    #[test]
    fn test_execution_progress_and_finalize() {
        let store = test_store();
        let run = seeded_run(&store);
        let exec = TaskExecution::new(&run.id, "task-1", "worker-1", EvalPhase::Baseline);
        store.create_task_execution(&exec).unwrap();
        store
            .update_task_execution_progress(&exec.id, 3, 120, 48, 0.002)
            .unwrap();
        store
            .finalize_task_execution(&exec.id, ExecutionStatus::Passed, Some(StopReason::Completed))
            .unwrap();
        let loaded = store.get_task_execution(&exec.id).unwrap();
        assert_eq!(loaded.step_count, 3);
        assert_eq!(loaded.tokens_in, 120);
        assert_eq!(loaded.status, ExecutionStatus::Passed);
        assert_eq!(loaded.stop_reason, Some(StopReason::Completed));
        assert!(loaded.ended_at.is_some());
    }

    #[test]
    fn test_agent_state_upsert_last_writer_wins() {
        let store = test_store();
        let run = seeded_run(&store);
        let exec = TaskExecution::new(&run.id, "task-1", "worker-1", EvalPhase::Baseline);
        store.create_task_execution(&exec).unwrap();

        let mut state = AgentMemoryState::for_goal("find auth docs", Default::default());
        store.upsert_task_agent_state(&exec.id, &run.id, &state).unwrap();
        state.current_step = 3;
        state.absorb_facts(&["keys live in the dashboard".into()]);
        store.upsert_task_agent_state(&exec.id, &run.id, &state).unwrap();

        let loaded = store.get_task_agent_state(&exec.id).unwrap().unwrap();
        assert_eq!(loaded.current_step, 3);
        assert_eq!(loaded.facts.len(), 1);
    }

    #[test]
    fn test_steps_ordered_by_insertion_id() {
        let store = test_store();
        let run = seeded_run(&store);
        let exec = TaskExecution::new(&run.id, "task-1", "worker-1", EvalPhase::Baseline);
        store.create_task_execution(&exec).unwrap();

        for phase in [StepPhase::Retrieve, StepPhase::Plan, StepPhase::Act, StepPhase::Reflect] {
            let step = StepTrace::new(&exec.id, 0, phase);
            store.persist_task_step(&run.id, &step).unwrap();
        }
        let steps = store.get_task_steps(&exec.id).unwrap();
        assert_eq!(steps.len(), 4);
        assert!(steps.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(steps[0].phase, StepPhase::Retrieve);
        assert_eq!(steps[3].phase, StepPhase::Reflect);
    }

    #[test]
    fn test_citations_roundtrip() {
        let store = test_store();
        let run = seeded_run(&store);
        let exec = TaskExecution::new(&run.id, "task-1", "worker-1", EvalPhase::Baseline);
        store.create_task_execution(&exec).unwrap();
        let step_id = store
            .persist_task_step(&run.id, &StepTrace::new(&exec.id, 0, StepPhase::Act))
            .unwrap();
        store
            .persist_task_step_citations(
                &run.id,
                step_id,
                &[StepCitation {
                    step_id: 0,
                    source: "https://d/a".into(),
                    snippet_hash: "cafe".into(),
                    excerpt: "use the api key".into(),
                    start_offset: Some(3),
                    end_offset: None,
                }],
            )
            .unwrap();
        let citations = store.get_step_citations(step_id).unwrap();
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].step_id, step_id);
        assert_eq!(citations[0].start_offset, Some(3));
    }

    #[test]
    fn test_event_append_and_seq_conflict() {
        let store = test_store();
        let run = seeded_run(&store);
        let payload = EventPayload::new(&run.id, "first");
        let seq = store.next_event_seq(&run.id).unwrap();
        assert_eq!(seq, 1);
        let id = store.append_run_event_at(&run.id, seq, "run.started", &payload).unwrap();
        assert!(id > 0);

        let conflict = store.append_run_event_at(&run.id, seq, "run.started", &payload);
        assert!(matches!(conflict, Err(StoreError::SeqConflict { seq: 1, .. })));
        assert_eq!(store.next_event_seq(&run.id).unwrap(), 2);
    }

    #[test]
    fn test_events_cursor_by_id() {
        let store = test_store();
        let run = seeded_run(&store);
        for i in 1..=5 {
            let payload = EventPayload::new(&run.id, format!("event {}", i));
            store
                .append_run_event_at(&run.id, i, "task.step.created", &payload)
                .unwrap();
        }
        let first_two = store.get_run_events_after(&run.id, 0, 2).unwrap();
        assert_eq!(first_two.len(), 2);
        let rest = store
            .get_run_events_after(&run.id, first_two[1].id, 100)
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|e| e.id > first_two[1].id));
    }

    #[test]
    fn test_evaluation_roundtrip_with_phase_filter() {
        let store = test_store();
        let run = seeded_run(&store);
        let eval = TaskEvaluation {
            run_id: run.id.clone(),
            task_id: "task-1".into(),
            phase: EvalPhase::Baseline,
            criterion_scores: CriterionScores::with_average(8.0, 7.0, 9.0, 8.0),
            pass: true,
            quality_pass: true,
            validity_pass: true,
            validity_blocked_reasons: vec![],
            failure_class: None,
            rationale: "well grounded".into(),
            judge_model: "gpt-4o-mini".into(),
            confidence: 0.9,
        };
        store.persist_task_evaluation(&eval).unwrap();
        let mut optimized = eval.clone();
        optimized.phase = EvalPhase::Optimized;
        optimized.pass = false;
        optimized.failure_class = Some(FailureClass::PoorStructure);
        store.persist_task_evaluation(&optimized).unwrap();

        let baseline = store.get_evaluations(&run.id, Some(EvalPhase::Baseline)).unwrap();
        assert_eq!(baseline.len(), 1);
        assert!(baseline[0].pass);
        let all = store.get_evaluations(&run.id, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].failure_class, Some(FailureClass::PoorStructure));
    }

    #[test]
    fn test_optimization_session_upsert() {
        let store = test_store();
        let run = seeded_run(&store);
        let mut session = SkillOptimizationSession::new(&run.id, SkillOrigin::None);
        store.upsert_optimization_session(&session).unwrap();
        session.status = SessionStatus::Completed;
        session.baseline_totals = Some(RunTotals::default());
        store.upsert_optimization_session(&session).unwrap();

        let loaded = store.get_optimization_session(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert!(loaded.baseline_totals.is_some());
        assert!(store.get_optimization_session("other").unwrap().is_none());
    }

    #[test]
    fn test_run_errors_ledger() {
        let store = test_store();
        let run = seeded_run(&store);
        store
            .persist_run_error(&run.id, "TASK_EXECUTION_ERROR", "model call failed")
            .unwrap();
        store.persist_run_error(&run.id, "RUN_FATAL", "boom").unwrap();
        let errors = store.get_run_errors(&run.id).unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].code, "RUN_FATAL");
    }

    #[test]
    fn test_artifacts_roundtrip() {
        let store = test_store();
        let run = seeded_run(&store);
        store
            .persist_ingestion_artifacts(
                &run.id,
                &[Artifact {
                    artifact_type: ArtifactType::Page,
                    source_url: "https://d/auth".into(),
                    content: "Use the api key header.".into(),
                    content_hash: "abcd".into(),
                    metadata: Some(serde_json::json!({"title": "Auth"})),
                }],
            )
            .unwrap();
        let artifacts = store.get_artifacts(&run.id).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].artifact_type, ArtifactType::Page);
        assert!(artifacts[0].metadata.is_some());
    }

    #[test]
    fn test_tasks_roundtrip_and_reset() {
        let store = test_store();
        let run = seeded_run(&store);
        let task = Task::new(&run.id, "Authenticate").with_signals(vec!["api key".into()]);
        store.persist_tasks(std::slice::from_ref(&task)).unwrap();
        store.update_task_status(&task.task_id, TaskStatus::Passed).unwrap();
        assert_eq!(store.get_tasks(&run.id).unwrap()[0].status, TaskStatus::Passed);

        store.reset_task_statuses(&run.id).unwrap();
        assert_eq!(store.get_tasks(&run.id).unwrap()[0].status, TaskStatus::Pending);
    }

    #[test]
    fn test_sum_execution_cost() {
        let store = test_store();
        let run = seeded_run(&store);
        for (task, cost) in [("t1", 0.002), ("t2", 0.003)] {
            let exec = TaskExecution::new(&run.id, task, "w", EvalPhase::Baseline);
            store.create_task_execution(&exec).unwrap();
            store
                .update_task_execution_progress(&exec.id, 1, 10, 10, cost)
                .unwrap();
        }
        assert!((store.sum_execution_cost(&run.id).unwrap() - 0.005).abs() < 1e-9);
    }
}
