//! Scheduler loop: a registrar enqueues one tick per interval; each tick fires
//! the schedule entries that are due.
//!
//! - `cron`: timezone-aware cron evaluation
//! - `cache`: last-fire timestamps per (owner, target)
//! - `source`: where schedule entries come from
//! - `tick`: the body of the tick job
//! - `registrar`: boundary-aligned tick registration

pub mod cache;
pub mod cron;
pub mod registrar;
pub mod source;
pub mod tick;

#[cfg(feature = "redis")]
pub use cache::RedisScheduleCache;
pub use cache::{CacheError, InMemoryScheduleCache, ScheduleCache, LAST_RUN_HASH};
pub use cron::{next_fire_after, parse_timezone, validate_cron_expression, CronError, CronEvaluator};
pub use registrar::{next_boundary, RegistrarHandle, TickRegistrar};
pub use source::{InMemoryScheduleSource, ScheduleSource, SourceError};
pub use tick::{SchedulerTick, TickSummary};
