//! Budget accounting
//!
//! Tracks per-execution steps, tokens and cost, pushes every delta to the
//! store (execution counters plus the atomic run-level cost add), and
//! answers the ordered termination checks: token budget first, then
//! cancellation, then the run cost cap. Step exhaustion is checked at the
//! top of each iteration by the loop itself.
//!
//! Pricing sits behind [`CostModel`] so provider-reported or per-model rates
//! can replace the flat placeholder.

use std::sync::Arc;

use docmodel::{CallUsage, RemainingBudget, RunConfig};
use docstore::{Store, StoreResult};
use tracing::debug;

use crate::llm::ModelUsage;

/// Pricing policy seam
pub trait CostModel: Send + Sync {
    fn cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64;
}

/// Flat per-megatoken pricing
pub struct FlatRateCostModel {
    pub input_usd_per_mtok: f64,
    pub output_usd_per_mtok: f64,
}

impl Default for FlatRateCostModel {
    fn default() -> Self {
        Self {
            input_usd_per_mtok: 0.5,
            output_usd_per_mtok: 2.0,
        }
    }
}

impl CostModel for FlatRateCostModel {
    fn cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1e6 * self.input_usd_per_mtok
            + output_tokens as f64 / 1e6 * self.output_usd_per_mtok
    }
}

/// Why the accountant wants the loop stopped, in check order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    TokenLimit,
    Cancelled,
    CostLimit,
}

/// Per-execution budget tracker
pub struct BudgetAccountant {
    store: Store,
    cost_model: Arc<dyn CostModel>,
    run_id: String,
    exec_id: String,
    max_steps: u32,
    max_tokens: u64,
    hard_cost_cap_usd: f64,
    steps_used: u32,
    tokens_in: u64,
    tokens_out: u64,
    cost_used: f64,
}

impl BudgetAccountant {
    pub fn new(
        store: Store,
        cost_model: Arc<dyn CostModel>,
        config: &RunConfig,
        run_id: &str,
        exec_id: &str,
    ) -> Self {
        Self {
            store,
            cost_model,
            run_id: run_id.to_string(),
            exec_id: exec_id.to_string(),
            max_steps: config.max_steps_per_task,
            max_tokens: config.max_tokens_per_task,
            hard_cost_cap_usd: config.hard_cost_cap_usd,
            steps_used: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost_used: 0.0,
        }
    }

    pub fn steps_used(&self) -> u32 {
        self.steps_used
    }

    pub fn cost_used(&self) -> f64 {
        self.cost_used
    }

    /// Top-of-iteration check
    pub fn steps_exhausted(&self) -> bool {
        self.steps_used >= self.max_steps
    }

    /// Count an iteration and persist the new step count
    pub fn begin_iteration(&mut self) -> StoreResult<()> {
        self.steps_used += 1;
        debug!(exec_id = %self.exec_id, steps = self.steps_used, "begin_iteration");
        self.persist_progress()
    }

    /// Apply one model call's usage: execution counters, then the atomic
    /// run-cost increment. Returns the priced delta for the step trace.
    pub fn apply(&mut self, usage: &ModelUsage) -> StoreResult<CallUsage> {
        let cost = self.cost_model.cost_usd(usage.input_tokens, usage.output_tokens);
        self.tokens_in += usage.input_tokens;
        self.tokens_out += usage.output_tokens;
        self.cost_used += cost;
        self.persist_progress()?;
        let run_total = self.store.increment_run_cost(&self.run_id, cost)?;
        debug!(
            exec_id = %self.exec_id,
            tokens = self.tokens_in + self.tokens_out,
            cost_delta = cost,
            run_total,
            "usage applied"
        );
        Ok(CallUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_estimate: cost,
            latency_ms: usage.latency_ms,
        })
    }

    fn persist_progress(&self) -> StoreResult<()> {
        self.store.update_task_execution_progress(
            &self.exec_id,
            self.steps_used,
            self.tokens_in,
            self.tokens_out,
            self.cost_used,
        )
    }

    /// Ordered termination checks after a model call
    pub fn check_after_call(&self) -> StoreResult<Option<StopSignal>> {
        if self.tokens_in + self.tokens_out >= self.max_tokens {
            return Ok(Some(StopSignal::TokenLimit));
        }
        if self.store.is_run_canceled(&self.run_id)? {
            return Ok(Some(StopSignal::Cancelled));
        }
        if self.store.run_cost(&self.run_id)? >= self.hard_cost_cap_usd {
            return Ok(Some(StopSignal::CostLimit));
        }
        Ok(None)
    }

    /// What the execution can still spend
    pub fn remaining(&self) -> StoreResult<RemainingBudget> {
        let run_cost = self.store.run_cost(&self.run_id)?;
        Ok(RemainingBudget {
            steps: self.max_steps.saturating_sub(self.steps_used),
            tokens: self.max_tokens.saturating_sub(self.tokens_in + self.tokens_out),
            cost_usd: (self.hard_cost_cap_usd - run_cost).max(0.0),
        })
    }
}

/// Apply model usage to an execution outside a live accountant; used by the
/// judge path after the loop has finished.
pub fn apply_usage_to_execution(
    store: &Store,
    cost_model: &dyn CostModel,
    exec_id: &str,
    usage: &ModelUsage,
) -> StoreResult<CallUsage> {
    let execution = store.get_task_execution(exec_id)?;
    let cost = cost_model.cost_usd(usage.input_tokens, usage.output_tokens);
    store.update_task_execution_progress(
        exec_id,
        execution.step_count,
        execution.tokens_in + usage.input_tokens,
        execution.tokens_out + usage.output_tokens,
        execution.cost_estimate + cost,
    )?;
    store.increment_run_cost(&execution.run_id, cost)?;
    Ok(CallUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost_estimate: cost,
        latency_ms: usage.latency_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel::{EvalPhase, Run, RunStatus, TaskExecution};

    fn seeded(config: RunConfig) -> (Store, Run, TaskExecution) {
        let store = Store::open_in_memory().unwrap();
        let run = Run::new("https://docs.example.com", config);
        store.create_run(&run).unwrap();
        let exec = TaskExecution::new(&run.id, "task-1", "worker-1", EvalPhase::Baseline);
        store.create_task_execution(&exec).unwrap();
        (store, run, exec)
    }

    fn usage(input: u64, output: u64) -> ModelUsage {
        ModelUsage {
            input_tokens: input,
            output_tokens: output,
            latency_ms: 7,
        }
    }

    #[test]
    fn test_flat_rate_pricing() {
        let model = FlatRateCostModel::default();
        let cost = model.cost_usd(1_000_000, 1_000_000);
        assert!((cost - 2.5).abs() < 1e-9);
        assert_eq!(model.cost_usd(0, 0), 0.0);
    }

    #[test]
    fn test_apply_updates_execution_and_run() {
        let (store, run, exec) = seeded(RunConfig::default());
        let mut accountant = BudgetAccountant::new(
            store.clone(),
            Arc::new(FlatRateCostModel::default()),
            &run.config,
            &run.id,
            &exec.id,
        );
        accountant.begin_iteration().unwrap();
        let applied = accountant.apply(&usage(100_000, 50_000)).unwrap();
        assert!((applied.cost_estimate - 0.15).abs() < 1e-9);

        let execution = store.get_task_execution(&exec.id).unwrap();
        assert_eq!(execution.step_count, 1);
        assert_eq!(execution.tokens_in, 100_000);
        assert_eq!(execution.tokens_out, 50_000);
        assert!((store.run_cost(&run.id).unwrap() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_run_cost_equals_sum_of_execution_costs() {
        let (store, run, exec) = seeded(RunConfig::default());
        let exec2 = TaskExecution::new(&run.id, "task-2", "worker-1", EvalPhase::Baseline);
        store.create_task_execution(&exec2).unwrap();
        let cost_model: Arc<dyn CostModel> = Arc::new(FlatRateCostModel::default());

        let mut a = BudgetAccountant::new(store.clone(), cost_model.clone(), &run.config, &run.id, &exec.id);
        let mut b = BudgetAccountant::new(store.clone(), cost_model, &run.config, &run.id, &exec2.id);
        a.apply(&usage(200_000, 10_000)).unwrap();
        b.apply(&usage(40_000, 90_000)).unwrap();
        a.apply(&usage(5_000, 5_000)).unwrap();

        let run_cost = store.run_cost(&run.id).unwrap();
        let summed = store.sum_execution_cost(&run.id).unwrap();
        assert!((run_cost - summed).abs() < 1e-6);
    }

    #[test]
    fn test_token_limit_signals_first() {
        let config = RunConfig {
            max_tokens_per_task: 1000,
            ..Default::default()
        };
        let (store, run, exec) = seeded(config);
        let mut accountant = BudgetAccountant::new(
            store.clone(),
            Arc::new(FlatRateCostModel::default()),
            &run.config,
            &run.id,
            &exec.id,
        );
        accountant.apply(&usage(900, 200)).unwrap();
        // run also canceled; token check still wins by order
        store.update_run_status(&run.id, RunStatus::Canceled).unwrap();
        assert_eq!(
            accountant.check_after_call().unwrap(),
            Some(StopSignal::TokenLimit)
        );
    }

    #[test]
    fn test_cancellation_signal() {
        let (store, run, exec) = seeded(RunConfig::default());
        let accountant = BudgetAccountant::new(
            store.clone(),
            Arc::new(FlatRateCostModel::default()),
            &run.config,
            &run.id,
            &exec.id,
        );
        assert_eq!(accountant.check_after_call().unwrap(), None);
        store.update_run_status(&run.id, RunStatus::Canceled).unwrap();
        assert_eq!(
            accountant.check_after_call().unwrap(),
            Some(StopSignal::Cancelled)
        );
    }

    #[test]
    fn test_cost_cap_signal() {
        let config = RunConfig {
            hard_cost_cap_usd: 0.001,
            ..Default::default()
        };
        let (store, run, exec) = seeded(config);
        let mut accountant = BudgetAccountant::new(
            store.clone(),
            Arc::new(FlatRateCostModel::default()),
            &run.config,
            &run.id,
            &exec.id,
        );
        accountant.apply(&usage(1_000_000, 1_000_000)).unwrap();
        assert_eq!(
            accountant.check_after_call().unwrap(),
            Some(StopSignal::CostLimit)
        );
    }

    #[test]
    fn test_steps_exhausted() {
        let config = RunConfig {
            max_steps_per_task: 2,
            ..Default::default()
        };
        let (store, run, exec) = seeded(config);
        let mut accountant = BudgetAccountant::new(
            store,
            Arc::new(FlatRateCostModel::default()),
            &run.config,
            &run.id,
            &exec.id,
        );
        assert!(!accountant.steps_exhausted());
        accountant.begin_iteration().unwrap();
        accountant.begin_iteration().unwrap();
        assert!(accountant.steps_exhausted());
    }

    #[test]
    fn test_remaining_budget() {
        let config = RunConfig {
            max_steps_per_task: 4,
            max_tokens_per_task: 10_000,
            hard_cost_cap_usd: 1.0,
            ..Default::default()
        };
        let (store, run, exec) = seeded(config);
        let mut accountant = BudgetAccountant::new(
            store,
            Arc::new(FlatRateCostModel::default()),
            &run.config,
            &run.id,
            &exec.id,
        );
        accountant.begin_iteration().unwrap();
        accountant.apply(&usage(4_000, 1_000)).unwrap();
        let remaining = accountant.remaining().unwrap();
        assert_eq!(remaining.steps, 3);
        assert_eq!(remaining.tokens, 5_000);
        assert!(remaining.cost_usd < 1.0);
    }

    #[test]
    fn test_apply_usage_to_execution_standalone() {
        let (store, run, exec) = seeded(RunConfig::default());
        let model = FlatRateCostModel::default();
        apply_usage_to_execution(&store, &model, &exec.id, &usage(10_000, 10_000)).unwrap();
        apply_usage_to_execution(&store, &model, &exec.id, &usage(10_000, 10_000)).unwrap();
        let execution = store.get_task_execution(&exec.id).unwrap();
        assert_eq!(execution.tokens_in, 20_000);
        let run_cost = store.run_cost(&run.id).unwrap();
        assert!((run_cost - execution.cost_estimate).abs() < 1e-9);
    }
}
