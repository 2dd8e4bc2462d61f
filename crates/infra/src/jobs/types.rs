//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Extra time past the job timeout before a running job counts as abandoned.
const LEASE_GRACE: Duration = Duration::from_secs(30);

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue lane. Workers drain `Critical` before `Default` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    Default,
    Low,
}

impl Priority {
    /// Lanes in drain order.
    pub const LANES: [Priority; 3] = [Priority::Critical, Priority::Default, Priority::Low];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Default => "default",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Default
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Failed with a retryable error, waiting for its backoff
    Retrying { error: String },
    /// Completed successfully; kept for its retention window
    Completed,
    /// Failed with a terminal error; never retried
    Discarded { error: String },
    /// Exhausted retries, moved to the dead-letter list
    DeadLettered { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Discarded { .. } | JobStatus::DeadLettered { .. }
        )
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once)
    pub max_retry: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retry: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retry: u32, delay: Duration) -> Self {
        Self {
            max_retry,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_retry: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retry,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a job that just finished attempt number `attempt` may run again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retry
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    pub retry: RetryPolicy,
    /// Per-attempt handler deadline.
    pub timeout: Duration,
    /// How long a completed job is kept before purge.
    pub retention: Duration,
    /// Reject duplicates of an active job for this long.
    pub dedupe_window: Option<Duration>,
    /// Explicit dedupe key; derived from type + payload when absent.
    pub dedupe_key: Option<String>,
    pub priority: Priority,
    /// Earliest execution time.
    pub process_at: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30 * 60),
            retention: Duration::ZERO,
            dedupe_window: None,
            dedupe_key: None,
            priority: Priority::Default,
            process_at: None,
        }
    }
}

impl EnqueueOptions {
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.retry.max_retry = max_retry;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn unique(mut self, window: Duration) -> Self {
        self.dedupe_window = Some(window);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }
}

/// Hex SHA-256 over job type and payload bytes.
pub fn derive_dedupe_key(job_type: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// A background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Routing key, e.g. `briefing:generate`
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: Priority,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub retention: Duration,
    /// Active-job uniqueness key and when its lock lapses
    pub dedupe_key: Option<String>,
    pub dedupe_until: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Executions started so far
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the job may next be claimed
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Running jobs past this instant are considered abandoned
    pub lease_until: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying,
    Discarded,
    DeadLettered,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    // Out-of-range durations clamp to a century.
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl Job {
    pub fn new(
        job_type: impl Into<String>,
        payload: JsonValue,
        opts: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let job_type = job_type.into();
        let dedupe_key = opts.dedupe_window.map(|_| {
            opts.dedupe_key
                .clone()
                .unwrap_or_else(|| derive_dedupe_key(&job_type, payload.to_string().as_bytes()))
        });
        let dedupe_until = opts.dedupe_window.map(|w| now + chrono_duration(w));

        Self {
            id: JobId::new(),
            job_type,
            payload,
            priority: opts.priority,
            retry: opts.retry.clone(),
            timeout: opts.timeout,
            retention: opts.retention,
            dedupe_key,
            dedupe_until,
            status: JobStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: opts.process_at,
            lease_until: None,
            completed_at: None,
            history: Vec::new(),
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// When the job is next eligible (creation time if never delayed).
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    /// Whether the dedupe lock of this job still blocks duplicates at `now`.
    pub fn holds_dedupe_lock(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.dedupe_until.is_some_and(|until| now < until)
    }

    /// Whether the current attempt is the last one the policy allows.
    pub fn is_final_attempt(&self) -> bool {
        !self.retry.should_retry(self.attempt)
    }

    /// When a completed/discarded job may be purged.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.map(|at| at + chrono_duration(self.retention))
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = now;
        self.lease_until = Some(now + chrono_duration(self.timeout + LEASE_GRACE));
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.record_attempt(started_at, now, None);
        self.lease_until = None;
        self.completed_at = Some(now);
    }

    /// Record a failed attempt and decide between retry and dead-letter.
    pub fn mark_failed(
        &mut self,
        error: String,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.record_attempt(started_at, now, Some(error.clone()));
        self.lease_until = None;

        if self.retry.should_retry(self.attempt) {
            let delay = self.retry.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono_duration(delay));
            self.status = JobStatus::Retrying { error };
            FailureOutcome::Retrying
        } else {
            self.status = JobStatus::DeadLettered { error };
            self.completed_at = Some(now);
            FailureOutcome::DeadLettered
        }
    }

    /// Record a terminal failure; no retry regardless of remaining budget.
    pub fn mark_discarded(
        &mut self,
        error: String,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.record_attempt(started_at, now, Some(error.clone()));
        self.lease_until = None;
        self.status = JobStatus::Discarded { error };
        self.completed_at = Some(now);
        FailureOutcome::Discarded
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>, error: Option<String>) {
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Handler failure classification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Bad input; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Temporary failure; retried within the budget.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Handler exceeded its deadline; retried like a transient failure.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// Referenced record is gone; never retried.
    #[error("not found: {0}")]
    NotFound(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient(_) | JobError::Timeout(_))
    }
}

/// Result of a handler invocation.
pub type JobResult = Result<(), JobError>;

/// Outcome of an enqueue call. A duplicate is a success, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted(JobId),
    /// An active job already holds this dedupe key.
    Duplicate(String),
}

impl EnqueueOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EnqueueOutcome::Accepted(id) => Some(*id),
            EnqueueOutcome::Duplicate(_) => None,
        }
    }
}

/// Entry in the dead-letter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            job,
            dead_lettered_at: at,
            reason,
        }
    }
}
