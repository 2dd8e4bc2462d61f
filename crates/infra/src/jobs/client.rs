//! Enqueue side of the job queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use firstsip_core::{EntityId, OwnerId, Settings, TargetId};

use super::store::{JobStore, JobStoreError};
use super::types::{EnqueueOptions, EnqueueOutcome, Job, Priority};

pub const TASK_GENERATE_BRIEFING: &str = "briefing:generate";
pub const TASK_EXECUTE_PLUGIN: &str = "plugin:execute";
pub const TASK_SCHEDULER_TICK: &str = "scheduler:per_minute";

/// Payload of [`TASK_GENERATE_BRIEFING`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratePayload {
    pub briefing_id: EntityId,
}

/// Payload of [`TASK_EXECUTE_PLUGIN`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub target_id: TargetId,
    pub owner_id: OwnerId,
    pub target_name: String,
    #[serde(default)]
    pub settings: Settings,
}

/// Payload of [`TASK_SCHEDULER_TICK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPayload {
    /// Interval boundary this tick belongs to.
    pub boundary: DateTime<Utc>,
}

pub fn generate_options() -> EnqueueOptions {
    EnqueueOptions::default()
        .max_retry(3)
        .timeout(Duration::from_secs(5 * 60))
        .retention(Duration::from_secs(24 * 3600))
        .unique(Duration::from_secs(3600))
}

pub fn execute_options() -> EnqueueOptions {
    EnqueueOptions::default()
        .max_retry(2)
        .timeout(Duration::from_secs(10 * 60))
        .retention(Duration::from_secs(24 * 3600))
        .unique(Duration::from_secs(30 * 60))
}

/// Options for the tick of `boundary` with the given interval.
///
/// For a 60 s interval: 50 s timeout, 55 s uniqueness, key embedding the
/// boundary so restarts and extra registrars collapse onto one tick.
pub fn tick_options(boundary: DateTime<Utc>, interval: Duration) -> EnqueueOptions {
    EnqueueOptions::default()
        .priority(Priority::Critical)
        .max_retry(0)
        .timeout(interval.mul_f64(50.0 / 60.0))
        .unique(interval.mul_f64(55.0 / 60.0))
        .dedupe_key(format!("{}:{}", TASK_SCHEDULER_TICK, boundary.timestamp()))
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("invalid job: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Downstream enqueue used by the scheduler tick.
pub trait ExecutionEnqueuer: Send + Sync {
    fn enqueue_execute(
        &self,
        target_id: TargetId,
        owner_id: OwnerId,
        target_name: &str,
        settings: Settings,
    ) -> Result<EnqueueOutcome, EnqueueError>;
}

impl<T> ExecutionEnqueuer for std::sync::Arc<T>
where
    T: ExecutionEnqueuer + ?Sized,
{
    fn enqueue_execute(
        &self,
        target_id: TargetId,
        owner_id: OwnerId,
        target_name: &str,
        settings: Settings,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        (**self).enqueue_execute(target_id, owner_id, target_name, settings)
    }
}

/// Explicit handle over a job store. Cheap to clone when `S` is.
#[derive(Debug, Clone)]
pub struct JobClient<S> {
    store: S,
}

impl<S: JobStore> JobClient<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue a job. A dedupe collision is `Ok(Duplicate)`, not an error.
    pub fn enqueue<P: Serialize>(
        &self,
        job_type: &str,
        payload: &P,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        if job_type.trim().is_empty() {
            return Err(EnqueueError::Validation("job type must not be empty".into()));
        }
        let payload = serde_json::to_value(payload)
            .map_err(|e| EnqueueError::Validation(format!("payload: {e}")))?;

        let job = Job::new(job_type, payload, &opts, Utc::now());
        let job_id = job.id;
        let outcome = self.store.enqueue(job)?;

        match &outcome {
            EnqueueOutcome::Accepted(_) => {
                debug!(job_id = %job_id, job_type, priority = opts.priority.as_str(), "job enqueued");
            }
            EnqueueOutcome::Duplicate(key) => {
                info!(job_type, dedupe_key = %key, "duplicate job skipped");
            }
        }
        Ok(outcome)
    }

    pub fn enqueue_generate(&self, briefing_id: EntityId) -> Result<EnqueueOutcome, EnqueueError> {
        self.enqueue(
            TASK_GENERATE_BRIEFING,
            &GeneratePayload { briefing_id },
            generate_options(),
        )
    }

    pub fn enqueue_tick(
        &self,
        boundary: DateTime<Utc>,
        interval: Duration,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        self.enqueue(
            TASK_SCHEDULER_TICK,
            &TickPayload { boundary },
            tick_options(boundary, interval),
        )
    }
}

impl<S: JobStore> ExecutionEnqueuer for JobClient<S> {
    fn enqueue_execute(
        &self,
        target_id: TargetId,
        owner_id: OwnerId,
        target_name: &str,
        settings: Settings,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        let payload = ExecutePayload {
            target_id,
            owner_id,
            target_name: target_name.to_string(),
            settings,
        };
        self.enqueue(TASK_EXECUTE_PLUGIN, &payload, execute_options())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobStatus;

    #[test]
    fn generate_twice_is_one_job() {
        let client = JobClient::new(InMemoryJobStore::arc());

        let first = client.enqueue_generate(EntityId::new(7)).unwrap();
        let second = client.enqueue_generate(EntityId::new(7)).unwrap();
        let other = client.enqueue_generate(EntityId::new(8)).unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert!(!other.is_duplicate());
        assert_eq!(client.store().stats().unwrap().pending, 2);
    }

    #[test]
    fn execute_payload_and_options() {
        let client = JobClient::new(InMemoryJobStore::arc());
        let mut settings = Settings::new();
        settings.insert("city".into(), serde_json::json!("Chicago"));

        let id = client
            .enqueue_execute(TargetId::new(3), OwnerId::new(9), "weather", settings)
            .unwrap()
            .job_id()
            .unwrap();

        let job = client.store().get(id).unwrap().unwrap();
        assert_eq!(job.job_type, TASK_EXECUTE_PLUGIN);
        assert_eq!(job.retry.max_retry, 2);
        assert_eq!(job.timeout, Duration::from_secs(600));
        assert_eq!(job.status, JobStatus::Pending);

        let payload: ExecutePayload = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload.target_name, "weather");
        assert_eq!(payload.settings["city"], "Chicago");
    }

    #[test]
    fn empty_job_type_is_rejected() {
        let client = JobClient::new(InMemoryJobStore::arc());
        let err = client
            .enqueue(" ", &serde_json::json!({}), EnqueueOptions::default())
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(_)));
    }

    #[test]
    fn tick_is_unique_per_boundary() {
        let client = JobClient::new(InMemoryJobStore::arc());
        let interval = Duration::from_secs(60);
        let b1 = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        let b2 = b1 + chrono::Duration::seconds(60);

        assert!(!client.enqueue_tick(b1, interval).unwrap().is_duplicate());
        assert!(client.enqueue_tick(b1, interval).unwrap().is_duplicate());
        assert!(!client.enqueue_tick(b2, interval).unwrap().is_duplicate());

        let opts = tick_options(b1, interval);
        assert_eq!(opts.priority, Priority::Critical);
        assert_eq!(opts.timeout, Duration::from_secs(50));
        assert_eq!(opts.dedupe_window, Some(Duration::from_secs(55)));
    }
}
