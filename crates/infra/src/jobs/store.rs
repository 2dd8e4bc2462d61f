//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, EnqueueOutcome, Job, JobId, JobStatus, Priority};

/// Job store abstraction.
///
/// Implementations own dedupe: `enqueue` must check and take the dedupe lock
/// atomically, and terminal updates must release it.
pub trait JobStore: Send + Sync {
    /// Enqueue a new job unless an active job holds the same dedupe key.
    fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Persist a job after a state change.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the next ready job, draining lanes in priority order.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Move a job to the dead-letter list.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    /// List dead-lettered jobs, oldest first.
    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Operator replay: move a dead-lettered job back to pending with a fresh budget.
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Running jobs whose lease expired before `now` (worker crashed mid-job).
    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Delete completed/discarded jobs whose retention elapsed. Returns the count.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Get job statistics.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub discarded: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// dedupe key -> job currently holding it
    unique: HashMap<String, JobId>,
}

impl Inner {
    fn release_dedupe(&mut self, job: &Job) {
        if let Some(key) = &job.dedupe_key {
            if self.unique.get(key) == Some(&job.id) {
                self.unique.remove(key);
            }
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner.write().map_err(|_| poisoned())
    }

    fn dlq_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, DeadLetterEntry>>, JobStoreError> {
        self.dead_letters.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".into())
}

fn lane_rank(p: Priority) -> usize {
    Priority::LANES.iter().position(|l| *l == p).unwrap_or(usize::MAX)
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }

        if let Some(key) = job.dedupe_key.clone() {
            let held = inner
                .unique
                .get(&key)
                .and_then(|holder| inner.jobs.get(holder))
                .is_some_and(|holder| holder.holds_dedupe_lock(job.created_at));
            if held {
                return Ok(EnqueueOutcome::Duplicate(key));
            }
            inner.unique.insert(key, job.id);
        }

        let id = job.id;
        inner.jobs.insert(id, job);
        Ok(EnqueueOutcome::Accepted(id))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        if !inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        if job.status.is_terminal() {
            inner.release_dedupe(job);
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;

        let next = inner
            .jobs
            .values()
            .filter(|j| j.status.is_claimable() && j.is_ready(now))
            .min_by_key(|j| (lane_rank(j.priority), j.ready_at(), j.created_at))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            inner.jobs.get_mut(&id).map(|job| {
                job.mark_running(now);
                job.clone()
            })
        }))
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        let mut dls = self.dlq_write()?;

        let now = Utc::now();
        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
            };
            job.updated_at = now;
        }

        inner.release_dedupe(&job);
        inner.jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason, now));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let mut dls = self.dlq_write()?;

        let entry = dls.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.lease_until = None;
        job.completed_at = None;
        job.dedupe_until = None;
        job.updated_at = Utc::now();
        job.history.clear();

        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.lease_until.is_some_and(|l| l < now))
            .cloned()
            .collect())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut inner = self.write()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| {
            let purgeable = matches!(j.status, JobStatus::Completed | JobStatus::Discarded { .. });
            !(purgeable && j.expires_at().is_some_and(|at| at <= now))
        });
        Ok(before - inner.jobs.len())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;

        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retrying { .. } => stats.retrying += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Discarded { .. } => stats.discarded += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        stats.dead_lettered += dls.len();
        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(job_id)
    }

    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).expired_leases(now)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).purge_expired(now)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
