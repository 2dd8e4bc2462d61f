//! Projections of bridge results onto persisted read models.
//!
//! Projections must be idempotent: the result stream is delivered at least once.

pub mod status;

pub use status::{ApplyOutcome, ProjectionError, StatusProjector};
