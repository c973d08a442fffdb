//! Event log and stream
//!
//! Every lifecycle boundary of a run appends here. Sequence numbers are
//! assigned optimistically: read max + 1, insert, and retry on conflict with
//! a small jittered backoff. In this process the store serializes writers
//! anyway, but the conflict-retry form is what keeps the append correct if
//! writers ever live in different processes.
//!
//! Readers never cursor on `seq`: the global insertion `id` is what totally
//! orders delivered events.

use std::collections::VecDeque;
use std::time::Duration;

use docmodel::{EventPayload, RunEvent};
use docstore::{Store, StoreError, StoreResult};
use rand::Rng;
use tracing::{debug, warn};

/// Bounded attempts for the optimistic seq-assignment loop
pub const MAX_APPEND_ATTEMPTS: u32 = 24;

/// Append handle over the store
#[derive(Clone)]
pub struct EventLog {
    store: Store,
}

impl EventLog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append one event; returns its global id
    pub async fn append(
        &self,
        run_id: &str,
        event_type: &str,
        payload: EventPayload,
    ) -> StoreResult<i64> {
        for attempt in 0..MAX_APPEND_ATTEMPTS {
            let seq = self.store.next_event_seq(run_id)?;
            match self.store.append_run_event_at(run_id, seq, event_type, &payload) {
                Ok(id) => {
                    debug!(%run_id, %event_type, seq, id, "event appended");
                    return Ok(id);
                }
                Err(StoreError::SeqConflict { .. }) if attempt + 1 < MAX_APPEND_ATTEMPTS => {
                    let jitter_ms = rand::rng().random_range(1..=5) * u64::from(attempt + 1);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::SeqConflict {
            run_id: run_id.to_string(),
            seq: -1,
        })
    }

    /// Fire-and-forget append; failures are logged, never propagated
    pub async fn emit(&self, run_id: &str, event_type: &str, payload: EventPayload) {
        if let Err(e) = self.append(run_id, event_type, payload).await {
            warn!(%run_id, %event_type, error = %e, "event append failed");
        }
    }

    /// Cursored read of events with id strictly after `after_id`
    pub fn read_after(&self, run_id: &str, after_id: i64, limit: usize) -> StoreResult<Vec<RunEvent>> {
        self.store.get_run_events_after(run_id, after_id, limit)
    }

    /// Follow a run's events from a cursor
    pub fn stream(&self, run_id: &str, after_id: i64) -> EventStream {
        EventStream::new(self.store.clone(), run_id, after_id)
    }
}

/// Polling reader that ends after a terminal run event
pub struct EventStream {
    store: Store,
    run_id: String,
    cursor: i64,
    poll_interval: Duration,
    buffer: VecDeque<RunEvent>,
    finished: bool,
}

const STREAM_BATCH: usize = 256;

impl EventStream {
    pub fn new(store: Store, run_id: &str, after_id: i64) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
            cursor: after_id,
            poll_interval: Duration::from_millis(10),
            buffer: VecDeque::new(),
            finished: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Next event in id order, or None once a terminal event was delivered
    pub async fn next(&mut self) -> StoreResult<Option<RunEvent>> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                if event.is_terminal() {
                    self.finished = true;
                }
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }

            let batch = self
                .store
                .get_run_events_after(&self.run_id, self.cursor, STREAM_BATCH)?;
            if let Some(last) = batch.last() {
                self.cursor = last.id;
                self.buffer.extend(batch);
                continue;
            }

            // nothing new; if the run went terminal without us seeing a
            // terminal event (cursor started past it), stop instead of
            // polling forever
            if self.store.run_status(&self.run_id)?.is_terminal() {
                let retry = self
                    .store
                    .get_run_events_after(&self.run_id, self.cursor, STREAM_BATCH)?;
                if retry.is_empty() {
                    self.finished = true;
                    return Ok(None);
                }
                if let Some(last) = retry.last() {
                    self.cursor = last.id;
                }
                self.buffer.extend(retry);
                continue;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Drain everything up to and including the terminal event
    pub async fn collect_to_end(mut self) -> StoreResult<Vec<RunEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }
}
