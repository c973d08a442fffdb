//! Per-phase aggregation
//!
//! Folds a phase's evaluations into run totals. Empty input yields all
//! zeros; the failure breakdown groups by failure class and excludes nulls.

use std::collections::BTreeMap;

use docmodel::{RunTotals, TaskEvaluation};

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Aggregate one phase's evaluations
pub fn aggregate(evaluations: &[TaskEvaluation]) -> RunTotals {
    if evaluations.is_empty() {
        return RunTotals::default();
    }

    let total_tasks = evaluations.len();
    let passed_tasks = evaluations.iter().filter(|e| e.pass).count();
    let quality_passed_tasks = evaluations.iter().filter(|e| e.quality_pass).count();
    let validity_passed_tasks = evaluations.iter().filter(|e| e.validity_pass).count();
    let failed_tasks = total_tasks - passed_tasks;

    let mut failure_breakdown: BTreeMap<String, usize> = BTreeMap::new();
    for evaluation in evaluations {
        if let Some(class) = evaluation.failure_class {
            *failure_breakdown.entry(class.to_string()).or_default() += 1;
        }
    }

    let average_score = evaluations
        .iter()
        .map(|e| e.criterion_scores.average)
        .sum::<f64>()
        / total_tasks as f64;

    RunTotals {
        total_tasks,
        passed_tasks,
        failed_tasks,
        pass_rate: round4(passed_tasks as f64 / total_tasks as f64),
        quality_passed_tasks,
        quality_pass_rate: round4(quality_passed_tasks as f64 / total_tasks as f64),
        validity_passed_tasks,
        validity_pass_rate: round4(validity_passed_tasks as f64 / total_tasks as f64),
        average_score: round4(average_score),
        failure_breakdown,
    }
}
