//! DocBench - documentation agent-readiness evaluation
//!
//! DocBench measures how well a documentation corpus lets autonomous
//! code-generation agents finish concrete implementation tasks. A run
//! ingests documentation, synthesizes a task set, drives model-backed
//! workers through a bounded retrieve/plan/act/reflect loop per task,
//! gates every attempt through deterministic checks plus an LLM rubric
//! judge, and optionally re-runs everything against a regenerated skill
//! document to measure uplift.
//!
//! # Modules
//!
//! - [`llm`] - model client seam, JSON completions, OpenAI-compatible provider
//! - [`ingest`] - documentation ingestion seam and local implementations
//! - [`retrieval`] - artifact chunking and the lexical retrieval index
//! - [`events`] - append-only run event log and polling stream
//! - [`budget`] - per-execution budget accounting and cost policy
//! - [`taskgen`] - task synthesis from templates, headings and user input
//! - [`agent`] - the per-task agent loop
//! - [`judge`] - deterministic guard plus the two-pass rubric judge
//! - [`aggregate`] - per-phase totals
//! - [`pool`] - bounded worker pool with a separate judge semaphore
//! - [`lifecycle`] - run status machine, cancellation, finalization
//! - [`skill`] - optimized-skill generation and artifact substitution
//! - [`phase`] - baseline/optimized phase executor
//! - [`orchestrator`] - run creation, background driver, observer surface
//! - [`config`] - application configuration loading
//! - [`cli`] - the `db` command-line interface

pub mod agent;
pub mod aggregate;
pub mod budget;
pub mod cli;
pub mod config;
pub mod context;
pub mod events;
pub mod ingest;
pub mod judge;
pub mod lifecycle;
pub mod llm;
pub mod orchestrator;
pub mod phase;
pub mod pool;
pub mod prompts;
pub mod retrieval;
pub mod skill;
pub mod taskgen;

// Re-export commonly used types
pub use aggregate::aggregate;
pub use budget::{BudgetAccountant, CostModel, FlatRateCostModel};
pub use context::Services;
pub use events::{EventLog, EventStream};
pub use ingest::{DirIngestor, FixtureIngestor, IngestError, IngestOutcome, Ingestor};
pub use judge::{Attempt, GuardOutcome, RubricJudge};
pub use llm::{MockModelClient, ModelClient, OpenAiClient};
pub use orchestrator::{Orchestrator, RunDetail, RunRequest};
pub use retrieval::{RetrievalIndex, RankedChunk};
