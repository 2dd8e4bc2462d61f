//! Redis-backed job store (shared broker for several worker processes).
//!
//! ## Keys (all under a configurable prefix, default `firstsip:jobs`)
//!
//! - `{p}:job:{id}`: job JSON
//! - `{p}:queue:{lane}`: sorted set of claimable ids, score = ready-at (ms)
//! - `{p}:running`: sorted set of running ids, score = lease expiry (ms)
//! - `{p}:done`: sorted set of completed/discarded ids, score = purge time (ms)
//! - `{p}:unique:{key}`: dedupe lock, `SET NX PX window`, value = holder id
//! - `{p}:dead`: hash id -> dead-letter entry JSON
//!
//! Claiming moves the id from its lane to `{p}:running` in one script, under
//! a short provisional lease, before the body is rewritten as running. A
//! worker that dies between the two steps leaves the id in `{p}:running`,
//! where lease recovery puts it back on its lane.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{DeadLetterEntry, EnqueueOutcome, Job, JobId, JobStatus, Priority};

const DEFAULT_PREFIX: &str = "firstsip:jobs";

/// Claim attempts per lane before moving on when ids have no job body.
const CLAIM_ATTEMPT_LIMIT: usize = 8;

/// Lease of an id between the claim script and the running write.
const CLAIM_GRACE: Duration = Duration::from_secs(60);

const CLAIM_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
redis.call('ZADD', KEYS[2], ARGV[2], ids[1])
redis.call('ZREM', KEYS[1], ids[1])
return ids[1]
";

const RELEASE_UNIQUE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

#[derive(Debug, Clone)]
pub struct RedisJobStore {
    client: Arc<redis::Client>,
    prefix: String,
}

fn storage(e: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// What lease recovery does with an id found in the running index.
#[derive(Debug)]
enum Recovery {
    /// A claimed job whose worker stopped responding.
    Expired(Job),
    /// Claimed by the script but never marked running.
    Requeue(Job),
    /// Index entry without a live running body.
    Drop,
}

fn recovery_for(job: Option<Job>) -> Recovery {
    match job {
        Some(job) if job.status == JobStatus::Running => Recovery::Expired(job),
        Some(job) if matches!(job.status, JobStatus::Pending | JobStatus::Retrying { .. }) => {
            Recovery::Requeue(job)
        }
        _ => Recovery::Drop,
    }
}

impl RedisJobStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(storage)?;
        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn conn(&self) -> Result<redis::Connection, JobStoreError> {
        self.client.get_connection().map_err(storage)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn queue_key(&self, lane: Priority) -> String {
        format!("{}:queue:{}", self.prefix, lane.as_str())
    }

    fn running_key(&self) -> String {
        format!("{}:running", self.prefix)
    }

    fn done_key(&self) -> String {
        format!("{}:done", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    fn unique_key(&self, key: &str) -> String {
        format!("{}:unique:{}", self.prefix, key)
    }

    fn load(&self, conn: &mut redis::Connection, id: &str) -> Result<Option<Job>, JobStoreError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(format!("{}:job:{}", self.prefix, id))
            .query(conn)
            .map_err(storage)?;
        raw.map(|s| serde_json::from_str(&s).map_err(storage))
            .transpose()
    }

    fn release_unique(&self, conn: &mut redis::Connection, job: &Job) -> Result<(), JobStoreError> {
        if let Some(key) = &job.dedupe_key {
            let _: i64 = redis::Script::new(RELEASE_UNIQUE_SCRIPT)
                .key(self.unique_key(key))
                .arg(job.id.to_string())
                .invoke(conn)
                .map_err(storage)?;
        }
        Ok(())
    }

    /// Write the job and move its id into the index matching its status.
    fn persist(&self, conn: &mut redis::Connection, job: &Job) -> Result<(), JobStoreError> {
        let json = serde_json::to_string(job).map_err(storage)?;
        let id = job.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(&json)
            .ignore()
            .cmd("ZREM")
            .arg(self.running_key())
            .arg(&id)
            .ignore();

        match &job.status {
            JobStatus::Pending | JobStatus::Retrying { .. } => {
                pipe.cmd("ZADD")
                    .arg(self.queue_key(job.priority))
                    .arg(millis(job.ready_at()))
                    .arg(&id)
                    .ignore();
            }
            JobStatus::Running => {
                let lease = job.lease_until.unwrap_or(job.updated_at);
                pipe.cmd("ZADD")
                    .arg(self.running_key())
                    .arg(millis(lease))
                    .arg(&id)
                    .ignore();
            }
            JobStatus::Completed | JobStatus::Discarded { .. } => {
                let expires = job.expires_at().unwrap_or(job.updated_at);
                pipe.cmd("ZADD")
                    .arg(self.done_key())
                    .arg(millis(expires))
                    .arg(&id)
                    .ignore();
            }
            JobStatus::DeadLettered { .. } => {}
        }

        pipe.query::<()>(conn).map_err(storage)?;

        if job.status.is_terminal() {
            self.release_unique(conn, job)?;
        }
        Ok(())
    }
}

impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut conn = self.conn()?;

        if let (Some(key), Some(until)) = (&job.dedupe_key, job.dedupe_until) {
            let window_ms = (until - job.created_at).num_milliseconds().max(1);
            let acquired: Option<String> = redis::cmd("SET")
                .arg(self.unique_key(key))
                .arg(job.id.to_string())
                .arg("NX")
                .arg("PX")
                .arg(window_ms)
                .query(&mut conn)
                .map_err(storage)?;
            if acquired.is_none() {
                return Ok(EnqueueOutcome::Duplicate(key.clone()));
            }
        }

        self.persist(&mut conn, &job)?;
        Ok(EnqueueOutcome::Accepted(job.id))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        self.load(&mut conn, &job_id.to_string())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = ?job.status), err)]
    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.job_key(job.id))
            .query(&mut conn)
            .map_err(storage)?;
        if !exists {
            return Err(JobStoreError::NotFound(job.id));
        }
        self.persist(&mut conn, job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        let grace = now + chrono::Duration::from_std(CLAIM_GRACE).unwrap_or(chrono::Duration::seconds(60));
        let script = redis::Script::new(CLAIM_SCRIPT);

        for lane in Priority::LANES {
            let queue = self.queue_key(lane);
            for _ in 0..CLAIM_ATTEMPT_LIMIT {
                let claimed: Option<String> = script
                    .key(&queue)
                    .key(self.running_key())
                    .arg(millis(now))
                    .arg(millis(grace))
                    .invoke(&mut conn)
                    .map_err(storage)?;
                let Some(id) = claimed else {
                    break;
                };

                let Some(mut job) = self.load(&mut conn, &id)? else {
                    warn!(job_id = %id, "queued id without job body; dropped");
                    let _: i64 = redis::cmd("ZREM")
                        .arg(self.running_key())
                        .arg(&id)
                        .query(&mut conn)
                        .map_err(storage)?;
                    continue;
                };
                job.mark_running(now);
                self.persist(&mut conn, &job)?;
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    #[instrument(skip(self, job, reason), fields(job_id = %job.id), err)]
    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
            };
            job.updated_at = now;
        }

        let id = job.id.to_string();
        let entry = DeadLetterEntry::new(job.clone(), reason, now);
        let json = serde_json::to_string(&entry).map_err(storage)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.dead_key())
            .arg(&id)
            .arg(&json)
            .ignore()
            .cmd("DEL")
            .arg(self.job_key(job.id))
            .ignore()
            .cmd("ZREM")
            .arg(self.running_key())
            .arg(&id)
            .ignore();
        for lane in Priority::LANES {
            pipe.cmd("ZREM").arg(self.queue_key(lane)).arg(&id).ignore();
        }
        pipe.query::<()>(&mut conn).map_err(storage)?;

        self.release_unique(&mut conn, &job)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.dead_key())
            .query(&mut conn)
            .map_err(storage)?;

        let mut entries = raw
            .iter()
            .map(|s| serde_json::from_str::<DeadLetterEntry>(s).map_err(storage))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.dead_lettered_at);
        entries.truncate(limit);
        Ok(entries)
    }

    #[instrument(skip(self), err)]
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut conn = self.conn()?;
        let id = job_id.to_string();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.dead_key())
            .arg(&id)
            .query(&mut conn)
            .map_err(storage)?;
        let entry: DeadLetterEntry = raw
            .ok_or(JobStoreError::NotFound(job_id))
            .and_then(|s| serde_json::from_str(&s).map_err(storage))?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.lease_until = None;
        job.completed_at = None;
        job.dedupe_until = None;
        job.updated_at = Utc::now();
        job.history.clear();

        let _: i64 = redis::cmd("HDEL")
            .arg(self.dead_key())
            .arg(&id)
            .query(&mut conn)
            .map_err(storage)?;
        self.persist(&mut conn, &job)?;
        Ok(job)
    }

    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.running_key())
            .arg("-inf")
            .arg(format!("({}", millis(now)))
            .query(&mut conn)
            .map_err(storage)?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match recovery_for(self.load(&mut conn, &id)?) {
                Recovery::Expired(job) => jobs.push(job),
                Recovery::Requeue(job) => {
                    warn!(job_id = %id, "claim interrupted before the job started; requeued");
                    self.persist(&mut conn, &job)?;
                }
                Recovery::Drop => {
                    let _: i64 = redis::cmd("ZREM")
                        .arg(self.running_key())
                        .arg(&id)
                        .query(&mut conn)
                        .map_err(storage)?;
                }
            }
        }
        Ok(jobs)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.done_key())
            .arg("-inf")
            .arg(millis(now))
            .query(&mut conn)
            .map_err(storage)?;

        for id in &ids {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("DEL")
                .arg(format!("{}:job:{}", self.prefix, id))
                .ignore()
                .cmd("ZREM")
                .arg(self.done_key())
                .arg(id)
                .ignore();
            pipe.query::<()>(&mut conn).map_err(storage)?;
        }
        Ok(ids.len())
    }

    /// Counts come from the indexes; retrying jobs are reported as pending.
    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut conn = self.conn()?;
        let mut stats = JobStats::default();

        for lane in Priority::LANES {
            let n: usize = redis::cmd("ZCARD")
                .arg(self.queue_key(lane))
                .query(&mut conn)
                .map_err(storage)?;
            stats.pending += n;
        }
        stats.running = redis::cmd("ZCARD")
            .arg(self.running_key())
            .query(&mut conn)
            .map_err(storage)?;
        stats.completed = redis::cmd("ZCARD")
            .arg(self.done_key())
            .query(&mut conn)
            .map_err(storage)?;
        stats.dead_lettered = redis::cmd("HLEN")
            .arg(self.dead_key())
            .query(&mut conn)
            .map_err(storage)?;
        Ok(stats)
    }
}
