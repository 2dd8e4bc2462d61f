//! Job server: a fixed pool of worker threads pulling from the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{FailureOutcome, Job, JobError, JobResult};

/// Per-invocation facts handed to a handler alongside the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub max_retry: u32,
    pub deadline: DateTime<Utc>,
    /// A retryable failure now dead-letters the job.
    pub is_final_attempt: bool,
}

impl JobContext {
    fn for_job(job: &Job, started: DateTime<Utc>) -> Self {
        let timeout = chrono::Duration::from_std(job.timeout).unwrap_or(chrono::Duration::MAX);
        Self {
            attempt: job.attempt,
            max_retry: job.retry.max_retry,
            deadline: started.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC),
            is_final_attempt: job.is_final_attempt(),
        }
    }
}

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(&Job, &JobContext) -> JobResult + Send + Sync>;

/// What an execution did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Retrying,
    Discarded,
    DeadLettered,
}

impl From<FailureOutcome> for ExecutionOutcome {
    fn from(o: FailureOutcome) -> Self {
        match o {
            FailureOutcome::Retrying => Self::Retrying,
            FailureOutcome::Discarded => Self::Discarded,
            FailureOutcome::DeadLettered => Self::DeadLettered,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobServerConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Worker threads
    pub concurrency: usize,
    /// Sleep when no job is ready
    pub poll_interval: Duration,
    /// Grace period for in-flight handlers on shutdown
    pub shutdown_timeout: Duration,
    /// Lease recovery and retention purge period
    pub maintenance_interval: Duration,
}

impl Default for JobServerConfig {
    fn default() -> Self {
        Self {
            name: "job-server".to_string(),
            concurrency: 5,
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

impl JobServerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}

/// Server runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_discarded: u64,
    pub jobs_dead_lettered: u64,
    pub leases_recovered: u64,
    pub jobs_purged: u64,
    pub current_running: usize,
}

impl ExecutorStats {
    fn record(&mut self, outcome: ExecutionOutcome) {
        self.jobs_processed += 1;
        match outcome {
            ExecutionOutcome::Completed => self.jobs_succeeded += 1,
            ExecutionOutcome::Retrying => self.jobs_retried += 1,
            ExecutionOutcome::Discarded => self.jobs_discarded += 1,
            ExecutionOutcome::DeadLettered => self.jobs_dead_lettered += 1,
        }
    }
}

type SharedStats = Arc<Mutex<ExecutorStats>>;

fn lock(stats: &SharedStats) -> MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to control a running server.
#[derive(Debug)]
pub struct JobServerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: SharedStats,
}

impl JobServerHandle {
    /// Stop claiming and wait for in-flight jobs up to the shutdown timeout.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        lock(&self.stats).clone()
    }
}

struct Shared<S> {
    store: S,
    handlers: HashMap<String, JobHandler>,
}

/// Background job server.
///
/// Workers claim jobs lane by lane, run the handler registered for the job
/// type under the job's timeout, and record completion, retry, discard or
/// dead-letter in the store.
pub struct JobServer<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
}

impl<S: JobStore + 'static> JobServer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a job type, replacing any previous one.
    pub fn register_handler<F>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(&Job, &JobContext) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(job_type.into(), Arc::new(handler));
    }

    pub fn handles(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Execute a job already claimed from the store.
    pub fn execute_one(&self, job: &mut Job) -> Result<ExecutionOutcome, JobStoreError> {
        execute_job(&self.store, &self.handlers, job)
    }

    /// Claim and execute ready jobs until none is left. Returns how many ran.
    pub fn drain(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut ran = 0;
        while let Some(mut job) = self.store.claim_next(now)? {
            self.execute_one(&mut job)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Re-queue running jobs whose lease expired and purge jobs past retention.
    pub fn maintain(&self, now: DateTime<Utc>) -> Result<(usize, usize), JobStoreError> {
        maintain(&self.store, now)
    }

    /// Spawn the supervisor and its worker pool.
    pub fn spawn(self, config: JobServerConfig) -> JobServerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats: SharedStats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();
        let shared = Arc::new(Shared {
            store: self.store,
            handlers: self.handlers,
        });

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || supervise(shared, config, shutdown_rx, stats_clone))
            .expect("failed to spawn job server thread");

        JobServerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn supervise<S: JobStore + 'static>(
    shared: Arc<Shared<S>>,
    config: JobServerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: SharedStats,
) {
    info!(server = %config.name, concurrency = config.concurrency, "job server started");

    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let concurrency = config.concurrency.max(1);

    for n in 0..concurrency {
        let shared = shared.clone();
        let stop = stop.clone();
        let stats = stats.clone();
        let done = done_tx.clone();
        let poll = config.poll_interval;
        let name = format!("{}-{}", config.name, n);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                worker_loop(&name, &shared, &stop, &stats, poll);
                let _ = done.send(());
            })
            .expect("failed to spawn job worker thread");
    }
    drop(done_tx);

    loop {
        match shutdown_rx.recv_timeout(config.maintenance_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => match maintain(&shared.store, Utc::now()) {
                Ok((recovered, purged)) => {
                    let mut s = lock(&stats);
                    s.leases_recovered += recovered as u64;
                    s.jobs_purged += purged as u64;
                }
                Err(e) => error!(server = %config.name, error = %e, "job maintenance failed"),
            },
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    stop.store(true, Ordering::SeqCst);
    let deadline = Instant::now() + config.shutdown_timeout;
    let mut stopped = 0;
    while stopped < concurrency {
        let left = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(left) {
            Ok(()) => stopped += 1,
            Err(_) => break,
        }
    }

    if stopped < concurrency {
        warn!(
            server = %config.name,
            abandoned = concurrency - stopped,
            "shutdown timeout elapsed with jobs in flight; their leases will expire"
        );
    }
    info!(server = %config.name, "job server stopped");
}

fn worker_loop<S: JobStore>(
    name: &str,
    shared: &Shared<S>,
    stop: &AtomicBool,
    stats: &SharedStats,
    poll_interval: Duration,
) {
    while !stop.load(Ordering::SeqCst) {
        match shared.store.claim_next(Utc::now()) {
            Ok(Some(mut job)) => {
                debug!(worker = name, job_id = %job.id, job_type = %job.job_type, attempt = job.attempt, "claimed job");
                lock(stats).current_running += 1;

                let result = execute_job(&shared.store, &shared.handlers, &mut job);

                let mut s = lock(stats);
                s.current_running = s.current_running.saturating_sub(1);
                match result {
                    Ok(outcome) => s.record(outcome),
                    Err(e) => {
                        drop(s);
                        error!(worker = name, job_id = %job.id, error = %e, "failed to record job outcome");
                    }
                }
            }
            Ok(None) => thread::sleep(poll_interval),
            Err(e) => {
                error!(worker = name, error = %e, "failed to claim job");
                thread::sleep(poll_interval);
            }
        }
    }
}

fn maintain<S: JobStore>(store: &S, now: DateTime<Utc>) -> Result<(usize, usize), JobStoreError> {
    let expired = store.expired_leases(now)?;
    let recovered = expired.len();
    for mut job in expired {
        let started = job.updated_at;
        warn!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt, "job lease expired; treating as failed attempt");
        settle_failure(store, &mut job, JobError::transient("lease expired"), started, now)?;
    }

    let purged = store.purge_expired(now)?;
    if recovered > 0 || purged > 0 {
        debug!(recovered, purged, "job maintenance pass");
    }
    Ok((recovered, purged))
}

fn execute_job<S: JobStore>(
    store: &S,
    handlers: &HashMap<String, JobHandler>,
    job: &mut Job,
) -> Result<ExecutionOutcome, JobStoreError> {
    let started = Utc::now();

    let result = match handlers.get(&job.job_type) {
        Some(handler) => run_with_timeout(handler.clone(), job, JobContext::for_job(job, started)),
        None => Err(JobError::validation(format!(
            "no handler registered for job type {}",
            job.job_type
        ))),
    };

    let now = Utc::now();
    match result {
        Ok(()) => {
            job.mark_completed(started, now);
            store.update(job)?;
            debug!(job_id = %job.id, job_type = %job.job_type, "job completed");
            Ok(ExecutionOutcome::Completed)
        }
        Err(e) => settle_failure(store, job, e, started, now),
    }
}

fn settle_failure<S: JobStore>(
    store: &S,
    job: &mut Job,
    err: JobError,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<ExecutionOutcome, JobStoreError> {
    let message = err.to_string();

    if !err.is_retryable() {
        job.mark_discarded(message.clone(), started, now);
        store.update(job)?;
        warn!(job_id = %job.id, job_type = %job.job_type, error = %message, "job discarded");
        return Ok(ExecutionOutcome::Discarded);
    }

    match job.mark_failed(message.clone(), started, now) {
        FailureOutcome::DeadLettered => {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempt,
                payload = %job.payload,
                error = %message,
                "job exhausted retries; dead-lettered"
            );
            store.dead_letter(job.clone(), message)?;
            Ok(ExecutionOutcome::DeadLettered)
        }
        other => {
            store.update(job)?;
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt,
                retry_at = ?job.scheduled_at,
                error = %message,
                "job failed; will retry"
            );
            Ok(other.into())
        }
    }
}

/// Run the handler on its own thread and stop waiting after the job timeout.
///
/// An overrunning handler is abandoned, not killed.
fn run_with_timeout(handler: JobHandler, job: &Job, ctx: JobContext) -> JobResult {
    let (tx, rx) = mpsc::channel();
    let owned = job.clone();
    let spawned = thread::Builder::new()
        .name(format!("job-{}", job.id))
        .spawn(move || {
            let _ = tx.send(handler(&owned, &ctx));
        });
    if let Err(e) = spawned {
        return Err(JobError::transient(format!("spawn handler thread: {e}")));
    }

    match rx.recv_timeout(job.timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(JobError::Timeout(job.timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(JobError::transient("handler panicked")),
    }
}
