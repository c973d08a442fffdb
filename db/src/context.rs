//! Shared service handles
//!
//! One bundle of cheaply-cloneable handles threaded through the pool, the
//! agent loop, the phase executor and the orchestrator entry.

use std::sync::Arc;

use docmodel::RunConfig;
use docstore::Store;

use crate::budget::{CostModel, FlatRateCostModel};
use crate::events::EventLog;
use crate::llm::{ModelCallConfig, ModelClient};
use crate::prompts::PromptRegistry;

#[derive(Clone)]
pub struct Services {
    pub store: Store,
    pub events: EventLog,
    pub model: Arc<dyn ModelClient>,
    pub prompts: Arc<PromptRegistry>,
    pub cost_model: Arc<dyn CostModel>,
}

impl Services {
    pub fn new(store: Store, model: Arc<dyn ModelClient>) -> eyre::Result<Self> {
        Ok(Self {
            events: EventLog::new(store.clone()),
            store,
            model,
            prompts: Arc::new(PromptRegistry::new()?),
            cost_model: Arc::new(FlatRateCostModel::default()),
        })
    }

    pub fn with_cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }
}

/// Call parameters for the rubric judge, derived from the run config
pub fn judge_call_config(config: &RunConfig) -> ModelCallConfig {
    ModelCallConfig {
        model: config.judge_model.clone(),
        temperature: Some(0.0),
        max_output_tokens: 2048,
        timeout_ms: config.timeout_ms,
        retries: config.retries,
    }
}
