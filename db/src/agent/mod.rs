//! Agent loop module
//!
//! One bounded retrieve/plan/act/reflect loop per (task, worker) pair, with
//! working memory upserted after every iteration.

mod engine;
pub mod outputs;

pub use engine::{
    AgentError, ExecutionOutcome, RETRIEVE_TOP_K, TaskAgent, build_query, classify_stop,
    looks_unresolved,
};
pub use outputs::{ActCitation, ActOutput, PlanOutput, ReflectOutput};
