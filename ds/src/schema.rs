//! Schema definition
//!
//! Column names are wire contracts shared with external consumers of the
//! database, hence camelCase identifiers. Indices back the hot queries:
//! child rows by run, events by (runId, seq) unique and (runId, id) for
//! cursors, one agent-state row per execution, evaluations by
//! (runId, taskId).

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    docsUrl      TEXT NOT NULL,
    status       TEXT NOT NULL,
    startedAt    INTEGER NOT NULL,
    endedAt      INTEGER,
    config       TEXT NOT NULL,
    totals       TEXT,
    costEstimate REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS tasks (
    taskId          TEXT PRIMARY KEY,
    runId           TEXT NOT NULL,
    name            TEXT NOT NULL,
    description     TEXT NOT NULL,
    category        TEXT NOT NULL,
    difficulty      TEXT NOT NULL,
    expectedSignals TEXT NOT NULL,
    status          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(runId);

CREATE TABLE IF NOT EXISTS workers (
    id            TEXT PRIMARY KEY,
    runId         TEXT NOT NULL,
    workerLabel   TEXT NOT NULL,
    modelProvider TEXT NOT NULL,
    modelName     TEXT NOT NULL,
    modelConfig   TEXT NOT NULL,
    status        TEXT NOT NULL,
    UNIQUE(runId, workerLabel)
);
CREATE INDEX IF NOT EXISTS idx_workers_run ON workers(runId);

CREATE TABLE IF NOT EXISTS task_executions (
    id           TEXT PRIMARY KEY,
    runId        TEXT NOT NULL,
    taskId       TEXT NOT NULL,
    workerId     TEXT NOT NULL,
    phase        TEXT NOT NULL,
    status       TEXT NOT NULL,
    stepCount    INTEGER NOT NULL DEFAULT 0,
    tokensIn     INTEGER NOT NULL DEFAULT 0,
    tokensOut    INTEGER NOT NULL DEFAULT 0,
    costEstimate REAL NOT NULL DEFAULT 0,
    stopReason   TEXT,
    startedAt    INTEGER NOT NULL,
    endedAt      INTEGER
);
CREATE INDEX IF NOT EXISTS idx_executions_run ON task_executions(runId);
CREATE INDEX IF NOT EXISTS idx_executions_run_task ON task_executions(runId, taskId);

CREATE TABLE IF NOT EXISTS task_agent_state (
    taskExecutionId TEXT PRIMARY KEY,
    runId           TEXT NOT NULL,
    state           TEXT NOT NULL,
    updatedAt       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_state_run ON task_agent_state(runId);

CREATE TABLE IF NOT EXISTS task_steps (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    taskExecutionId TEXT NOT NULL,
    runId           TEXT NOT NULL,
    stepIndex       INTEGER NOT NULL,
    phase           TEXT NOT NULL,
    input           TEXT NOT NULL,
    output          TEXT NOT NULL,
    retrieval       TEXT,
    usage           TEXT,
    decision        TEXT,
    createdAt       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_steps_execution ON task_steps(taskExecutionId);
CREATE INDEX IF NOT EXISTS idx_steps_run ON task_steps(runId);

CREATE TABLE IF NOT EXISTS step_citations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    stepId      INTEGER NOT NULL,
    runId       TEXT NOT NULL,
    source      TEXT NOT NULL,
    snippetHash TEXT NOT NULL,
    excerpt     TEXT NOT NULL,
    startOffset INTEGER,
    endOffset   INTEGER
);
CREATE INDEX IF NOT EXISTS idx_citations_step ON step_citations(stepId);
CREATE INDEX IF NOT EXISTS idx_citations_run ON step_citations(runId);

CREATE TABLE IF NOT EXISTS deterministic_checks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    taskExecutionId TEXT NOT NULL,
    runId           TEXT NOT NULL,
    name            TEXT NOT NULL,
    passed          INTEGER NOT NULL,
    scoreDelta      REAL NOT NULL,
    details         TEXT
);
CREATE INDEX IF NOT EXISTS idx_checks_execution ON deterministic_checks(taskExecutionId);
CREATE INDEX IF NOT EXISTS idx_checks_run ON deterministic_checks(runId);

CREATE TABLE IF NOT EXISTS task_attempts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    taskExecutionId TEXT NOT NULL,
    runId           TEXT NOT NULL,
    taskId          TEXT NOT NULL,
    phase           TEXT NOT NULL,
    answer          TEXT NOT NULL,
    steps           TEXT NOT NULL,
    createdAt       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempts_run_task ON task_attempts(runId, taskId);

CREATE TABLE IF NOT EXISTS task_evaluations (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    runId                  TEXT NOT NULL,
    taskId                 TEXT NOT NULL,
    phase                  TEXT NOT NULL,
    criterionScores        TEXT NOT NULL,
    pass                   INTEGER NOT NULL,
    qualityPass            INTEGER NOT NULL,
    validityPass           INTEGER NOT NULL,
    validityBlockedReasons TEXT NOT NULL,
    failureClass           TEXT,
    rationale              TEXT NOT NULL,
    judgeModel             TEXT NOT NULL,
    confidence             REAL NOT NULL,
    createdAt              INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_evaluations_run_task ON task_evaluations(runId, taskId);

CREATE TABLE IF NOT EXISTS run_events (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    runId     TEXT NOT NULL,
    seq       INTEGER NOT NULL,
    eventType TEXT NOT NULL,
    payload   TEXT NOT NULL,
    createdAt INTEGER NOT NULL,
    UNIQUE(runId, seq)
);
CREATE INDEX IF NOT EXISTS idx_events_run_id ON run_events(runId, id);

CREATE TABLE IF NOT EXISTS run_errors (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    runId     TEXT NOT NULL,
    code      TEXT NOT NULL,
    message   TEXT NOT NULL,
    createdAt INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_errors_run ON run_errors(runId);

CREATE TABLE IF NOT EXISTS ingestion_artifacts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    runId        TEXT NOT NULL,
    artifactType TEXT NOT NULL,
    sourceUrl    TEXT NOT NULL,
    content      TEXT NOT NULL,
    contentHash  TEXT NOT NULL,
    metadata     TEXT,
    createdAt    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_run ON ingestion_artifacts(runId);

CREATE TABLE IF NOT EXISTS skill_optimization_sessions (
    runId             TEXT PRIMARY KEY,
    status            TEXT NOT NULL,
    sourceSkillOrigin TEXT NOT NULL,
    baselineTotals    TEXT,
    optimizedTotals   TEXT,
    delta             TEXT,
    errorMessage      TEXT,
    updatedAt         INTEGER NOT NULL
);
"#;
