//! DocStore - SQLite persistence for docbench runs
//!
//! One method per store primitive. The handle is cheap to clone and safe to
//! share across tasks; a connection mutex serializes access, and the event
//! append keeps the sequence-conflict contract so the access pattern could
//! move across processes without changing callers.
//!
//! Two store-enforced invariants matter to callers:
//! - run cost increments are applied with `UPDATE ... SET cost = cost + ?`,
//!   so concurrent appliers never lose an increment;
//! - once a run is terminal, insert- and progress-writes for its executions
//!   and steps are rejected with [`StoreError::RunTerminal`].

mod error;
mod schema;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::{RunErrorRecord, Store};
