//! Run lifecycle
//!
//! The status DAG is queued, ingesting, generating_tasks, running,
//! evaluating, then one of completed/failed/canceled. Terminal states are
//! sticky: a transition attempt against a terminal run is a no-op, and only
//! the finalizer rewrites terminal state. Cancellation is cooperative; it
//! flips the status and emits an event, and every loop observes it at its
//! next boundary.

use docmodel::{EventPayload, RunStatus, RunTotals, event_types};
use docstore::Store;
use eyre::bail;
use serde_json::json;
use tracing::{debug, info};

use crate::events::EventLog;

/// Advance a run to the next lifecycle stage
///
/// Returns the effective status: the requested one, or the current terminal
/// status when the run finished underneath us (a no-op, not an error).
pub async fn transition(
    store: &Store,
    events: &EventLog,
    run_id: &str,
    to: RunStatus,
) -> eyre::Result<RunStatus> {
    let current = store.run_status(run_id)?;
    if current.is_terminal() {
        debug!(%run_id, %current, requested = %to, "transition ignored on terminal run");
        return Ok(current);
    }
    if !current.can_transition_to(to) {
        bail!("illegal run transition {} -> {}", current, to);
    }
    store.update_run_status(run_id, to)?;
    events
        .emit(
            run_id,
            event_types::RUN_STATUS_CHANGED,
            EventPayload::new(run_id, format!("run is {}", to))
                .with_data(json!({"from": current.to_string(), "to": to.to_string()})),
        )
        .await;
    info!(%run_id, from = %current, to = %to, "run transitioned");
    Ok(to)
}

/// Cooperative cancel: writes canceled and emits run.canceled. Rejected for
/// runs that are already terminal.
pub async fn cancel(store: &Store, events: &EventLog, run_id: &str) -> eyre::Result<()> {
    let current = store.run_status(run_id)?;
    if current.is_terminal() {
        bail!("run {} is already terminal ({})", run_id, current);
    }
    store.update_run_status(run_id, RunStatus::Canceled)?;
    events
        .append(
            run_id,
            event_types::RUN_CANCELED,
            EventPayload::new(run_id, "run canceled"),
        )
        .await?;
    info!(%run_id, "run canceled");
    Ok(())
}

fn terminal_event_type(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => event_types::RUN_COMPLETED,
        RunStatus::Failed => event_types::RUN_FAILED,
        _ => event_types::RUN_CANCELED,
    }
}

/// Authoritative terminal write: totals, endedAt, worker cleanup, and the
/// terminal event. When the run was already canceled (cancel emitted its
/// own event) the totals still land but no duplicate event is appended.
pub async fn finalize(
    store: &Store,
    events: &EventLog,
    run_id: &str,
    status: RunStatus,
    totals: Option<&RunTotals>,
) -> eyre::Result<()> {
    debug_assert!(status.is_terminal());
    let previous = store.run_status(run_id)?;
    store.finalize_run(run_id, status, totals)?;
    if !previous.is_terminal() {
        events
            .emit(
                run_id,
                terminal_event_type(status),
                EventPayload::new(run_id, format!("run {}", status))
                    .with_data(json!({"hasTotals": totals.is_some()})),
            )
            .await;
    }
    info!(%run_id, %status, has_totals = totals.is_some(), "run finalized");
    Ok(())
}
