//! `firstsip-core`: shared building blocks of the background execution subsystem.
//!
//! This crate holds **pure** types (no IO): identifiers, the error model, the
//! run/briefing status state machine and the schedule definition.

pub mod briefing;
pub mod error;
pub mod id;
pub mod run;
pub mod schedule;
pub mod status;

pub use briefing::Briefing;
pub use error::{CoreError, CoreResult};
pub use id::{CorrelationId, EntityId, OwnerId, TargetId};
pub use run::RunRecord;
pub use schedule::{ScheduleEntry, Settings};
pub use status::RunStatus;
