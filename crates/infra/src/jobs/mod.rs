//! Background job queue with dedupe, priority lanes, retries and dead-letter.
//!
//! ## Components
//!
//! - `Job`: payload plus retry/timeout/retention/dedupe metadata
//! - `JobStore`: persistence and claiming (in-memory, or Redis with the `redis` feature)
//! - `JobClient`: enqueue side, a duplicate enqueue is reported as success
//! - `JobServer`: fixed worker pool running registered handlers under per-job timeouts

pub mod client;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod server;
pub mod store;
pub mod types;

pub use client::{
    EnqueueError, ExecutePayload, ExecutionEnqueuer, GeneratePayload, JobClient, TickPayload,
    TASK_EXECUTE_PLUGIN, TASK_GENERATE_BRIEFING, TASK_SCHEDULER_TICK,
};
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use server::{
    ExecutionOutcome, ExecutorStats, JobContext, JobHandler, JobServer, JobServerConfig,
    JobServerHandle,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, EnqueueOptions, EnqueueOutcome, Job, JobError, JobId,
    JobResult, JobStatus, Priority, RetryPolicy,
};
