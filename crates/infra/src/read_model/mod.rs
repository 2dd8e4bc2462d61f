//! Persisted records this subsystem reads and writes.
//!
//! - `runs`: one record per plugin execution, monotonic status
//! - `briefings`: generated briefings
//! - `postgres`: sqlx-backed implementations of both, plus the schedule source

pub mod briefings;
pub mod postgres;
pub mod runs;

pub use briefings::{BriefingStore, BriefingStoreError, InMemoryBriefingStore};
pub use postgres::{PostgresBriefingStore, PostgresRunStore, PostgresScheduleSource};
pub use runs::{InMemoryRunStore, RunStore, RunStoreError};
