//! Job handlers for the built-in job types.
//!
//! - `briefing:generate` calls the briefing generator and stores the content
//! - `plugin:execute` creates a run record and hands the request to the executor
//! - `scheduler:per_minute` runs one scheduler tick

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use firstsip_core::{Briefing, CorrelationId, RunRecord};
use firstsip_streams::{ExecutionRequest, RequestPublisher};

use crate::generator::BriefingGenerator;
use crate::jobs::client::{
    ExecutePayload, ExecutionEnqueuer, GeneratePayload, TickPayload, TASK_EXECUTE_PLUGIN,
    TASK_GENERATE_BRIEFING, TASK_SCHEDULER_TICK,
};
use crate::jobs::server::{JobContext, JobServer};
use crate::jobs::store::JobStore;
use crate::jobs::types::{Job, JobError, JobResult};
use crate::read_model::briefings::BriefingStore;
use crate::read_model::runs::RunStore;
use crate::scheduler::cache::ScheduleCache;
use crate::scheduler::source::ScheduleSource;
use crate::scheduler::tick::SchedulerTick;

fn decode<P: DeserializeOwned>(job: &Job) -> Result<P, JobError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| JobError::validation(format!("invalid {} payload: {e}", job.job_type)))
}

/// `briefing:generate`
pub struct GenerateBriefingHandler<B, G> {
    briefings: B,
    generator: G,
}

impl<B: BriefingStore, G: BriefingGenerator> GenerateBriefingHandler<B, G> {
    pub fn new(briefings: B, generator: G) -> Self {
        Self {
            briefings,
            generator,
        }
    }

    pub fn handle(&self, job: &Job, ctx: &JobContext) -> JobResult {
        let GeneratePayload { briefing_id } = decode(job)?;

        let mut briefing = self
            .briefings
            .get(briefing_id)
            .map_err(|e| JobError::transient(e.to_string()))?
            .ok_or_else(|| {
                error!(%briefing_id, "briefing not found");
                JobError::not_found(format!("briefing {briefing_id}"))
            })?;

        if briefing.status.is_terminal() {
            info!(%briefing_id, status = %briefing.status, "briefing already finished; nothing to do");
            return Ok(());
        }

        info!(%briefing_id, owner_id = %briefing.owner_id, attempt = ctx.attempt, "generating briefing");
        briefing
            .mark_processing()
            .map_err(|e| JobError::validation(e.to_string()))?;
        self.save(&briefing)?;

        let content = match self.generator.generate(briefing.owner_id) {
            Ok(content) => content,
            Err(e) => {
                let retryable = e.is_retryable();
                error!(%briefing_id, error = %e, retryable, final_attempt = ctx.is_final_attempt, "briefing generation failed");
                if !retryable || ctx.is_final_attempt {
                    self.fail(&mut briefing, e.to_string());
                }
                return Err(if retryable {
                    JobError::transient(e.to_string())
                } else {
                    JobError::validation(e.to_string())
                });
            }
        };

        let content = match serde_json::to_value(&content) {
            Ok(value) => value,
            Err(e) => {
                self.fail(&mut briefing, "failed to encode content");
                return Err(JobError::validation(format!("encode content: {e}")));
            }
        };

        briefing
            .complete(content, Utc::now())
            .map_err(|e| JobError::validation(e.to_string()))?;
        self.save(&briefing)?;

        info!(%briefing_id, "briefing generation completed");
        Ok(())
    }

    fn save(&self, briefing: &Briefing) -> JobResult {
        self.briefings.save(briefing).map_err(|e| JobError::transient(e.to_string()))
    }

    /// Best effort: the job error is what matters to the queue.
    fn fail(&self, briefing: &mut Briefing, reason: impl Into<String>) {
        if briefing.fail(reason).is_ok() {
            if let Err(e) = self.briefings.save(briefing) {
                warn!(briefing_id = %briefing.id, error = %e, "failed to record briefing failure");
            }
        }
    }
}

impl<B, G> GenerateBriefingHandler<B, G>
where
    B: BriefingStore + 'static,
    G: BriefingGenerator + 'static,
{
    pub fn register<S: JobStore + 'static>(self, server: &mut JobServer<S>) {
        server.register_handler(TASK_GENERATE_BRIEFING, move |job, ctx| self.handle(job, ctx));
    }
}

/// `plugin:execute`
///
/// Every attempt creates its own run record, so a publish failure fails only
/// that attempt's record and the retry starts a fresh one.
pub struct ExecutePluginHandler<R, P> {
    runs: R,
    publisher: P,
}

impl<R: RunStore, P: RequestPublisher> ExecutePluginHandler<R, P> {
    pub fn new(runs: R, publisher: P) -> Self {
        Self { runs, publisher }
    }

    /// Returns the correlation id of the published run.
    pub fn execute(&self, payload: ExecutePayload) -> Result<CorrelationId, JobError> {
        let correlation_id = CorrelationId::generate();
        let mut run = RunRecord::pending(
            correlation_id.clone(),
            payload.owner_id,
            payload.target_id,
            JsonValue::Object(payload.settings.clone()),
            Utc::now(),
        );
        self.runs
            .create(&run)
            .map_err(|e| JobError::transient(format!("create run record: {e}")))?;

        let request = ExecutionRequest {
            correlation_id: correlation_id.clone(),
            target_name: payload.target_name.clone(),
            owner_id: payload.owner_id,
            settings: payload.settings,
        };

        let message_id = match self.publisher.publish(&request) {
            Ok(id) => id,
            Err(e) => {
                error!(%correlation_id, error = %e, "failed to publish execution request");
                if run.fail(format!("publish failed: {e}"), Utc::now()).is_ok() {
                    if let Err(save_err) = self.runs.save_if_not_terminal(&run) {
                        warn!(%correlation_id, error = %save_err, "failed to record publish failure");
                    }
                }
                return Err(JobError::transient(format!("publish: {e}")));
            }
        };

        // The request is out; a failure from here on must not trigger a retry
        // that would publish it again.
        if run.mark_processing().is_ok() {
            match self.runs.save_if_not_terminal(&run) {
                Ok(true) => {}
                Ok(false) => debug!(%correlation_id, "result arrived before processing was recorded"),
                Err(e) => warn!(%correlation_id, error = %e, "failed to mark run processing"),
            }
        }

        info!(
            %correlation_id,
            message_id = %message_id,
            target_name = %payload.target_name,
            owner_id = %payload.owner_id,
            "execution request published"
        );
        Ok(correlation_id)
    }

    pub fn handle(&self, job: &Job, _ctx: &JobContext) -> JobResult {
        let payload: ExecutePayload = decode(job)?;
        if payload.target_name.trim().is_empty() {
            return Err(JobError::validation("target name must not be empty"));
        }
        self.execute(payload).map(|_| ())
    }
}

impl<R, P> ExecutePluginHandler<R, P>
where
    R: RunStore + 'static,
    P: RequestPublisher + 'static,
{
    pub fn register<S: JobStore + 'static>(self, server: &mut JobServer<S>) {
        server.register_handler(TASK_EXECUTE_PLUGIN, move |job, ctx| self.handle(job, ctx));
    }
}

/// `scheduler:per_minute`
pub struct SchedulerTickHandler<Src, C, E> {
    tick: SchedulerTick<Src, C, E>,
}

impl<Src, C, E> SchedulerTickHandler<Src, C, E>
where
    Src: ScheduleSource,
    C: ScheduleCache,
    E: ExecutionEnqueuer,
{
    pub fn new(tick: SchedulerTick<Src, C, E>) -> Self {
        Self { tick }
    }

    /// Evaluates at the tick's boundary, or now if the job runs early.
    pub fn handle(&self, job: &Job, _ctx: &JobContext) -> JobResult {
        let TickPayload { boundary } = decode(job)?;
        let at = boundary.min(Utc::now());
        self.tick
            .run(at)
            .map(|_| ())
            .map_err(|e| JobError::transient(e.to_string()))
    }
}

impl<Src, C, E> SchedulerTickHandler<Src, C, E>
where
    Src: ScheduleSource + 'static,
    C: ScheduleCache + 'static,
    E: ExecutionEnqueuer + 'static,
{
    pub fn register<S: JobStore + 'static>(self, server: &mut JobServer<S>) {
        server.register_handler(TASK_SCHEDULER_TICK, move |job, ctx| self.handle(job, ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firstsip_core::RunStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::DateTime;
    use firstsip_core::{EntityId, OwnerId, Settings, TargetId};
    use firstsip_streams::{InMemoryStreamLog, Producer, StreamError, StreamLog, REQUEST_STREAM};

    use crate::generator::{BriefingContent, GeneratorError, StubGenerator};
    use crate::jobs::client::{EnqueueError, ExecutionEnqueuer};
    use crate::jobs::types::{EnqueueOptions, EnqueueOutcome, JobId};
    use crate::read_model::briefings::InMemoryBriefingStore;
    use crate::read_model::runs::InMemoryRunStore;
    use crate::scheduler::cache::InMemoryScheduleCache;
    use crate::scheduler::cron::CronEvaluator;
    use crate::scheduler::source::InMemoryScheduleSource;

    fn job<P: serde::Serialize>(job_type: &str, payload: &P) -> Job {
        Job::new(
            job_type,
            serde_json::to_value(payload).unwrap(),
            &EnqueueOptions::default().max_retry(3),
            Utc::now(),
        )
    }

    fn ctx(attempt: u32, is_final_attempt: bool) -> JobContext {
        JobContext {
            attempt,
            max_retry: 3,
            deadline: Utc::now() + chrono::Duration::minutes(5),
            is_final_attempt,
        }
    }

    /// Fails with the given error a fixed number of times, then succeeds.
    struct Flaky {
        failures: AtomicUsize,
        error: fn() -> GeneratorError,
    }

    impl BriefingGenerator for Flaky {
        fn generate(&self, _owner_id: OwnerId) -> Result<BriefingContent, GeneratorError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            Ok(StubGenerator::content())
        }
    }

    fn briefings() -> Arc<InMemoryBriefingStore> {
        let store = Arc::new(InMemoryBriefingStore::new());
        store.insert(Briefing::pending(EntityId::new(1), OwnerId::new(9)));
        store
    }

    fn generate_job() -> Job {
        job(TASK_GENERATE_BRIEFING, &GeneratePayload { briefing_id: EntityId::new(1) })
    }

    #[test]
    fn generate_stores_content() {
        let store = briefings();
        let handler = GenerateBriefingHandler::new(store.clone(), StubGenerator::new());

        handler.handle(&generate_job(), &ctx(1, false)).unwrap();

        let b = store.get(EntityId::new(1)).unwrap().unwrap();
        assert_eq!(b.status, RunStatus::Completed);
        assert_eq!(b.content.unwrap()["weather"]["location"], "San Francisco");
        assert!(b.generated_at.is_some());
    }

    #[test]
    fn transient_failure_keeps_briefing_processing_until_final_attempt() {
        let store = briefings();
        let handler = GenerateBriefingHandler::new(
            store.clone(),
            Flaky {
                failures: AtomicUsize::new(10),
                error: || GeneratorError::Network("connection refused".into()),
            },
        );

        let err = handler.handle(&generate_job(), &ctx(1, false)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.get(EntityId::new(1)).unwrap().unwrap().status, RunStatus::Processing);

        handler.handle(&generate_job(), &ctx(4, true)).unwrap_err();
        let b = store.get(EntityId::new(1)).unwrap().unwrap();
        assert_eq!(b.status, RunStatus::Failed);
        assert!(b.error.unwrap().contains("connection refused"));
    }

    #[test]
    fn retry_after_transient_failure_completes() {
        let store = briefings();
        let handler = GenerateBriefingHandler::new(
            store.clone(),
            Flaky {
                failures: AtomicUsize::new(1),
                error: || GeneratorError::Api { status: 503, body: String::new() },
            },
        );

        assert!(handler.handle(&generate_job(), &ctx(1, false)).is_err());
        handler.handle(&generate_job(), &ctx(2, false)).unwrap();
        assert_eq!(store.get(EntityId::new(1)).unwrap().unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn terminal_generator_error_fails_immediately() {
        let store = briefings();
        let handler = GenerateBriefingHandler::new(
            store.clone(),
            Flaky {
                failures: AtomicUsize::new(1),
                error: || GeneratorError::Api { status: 401, body: "bad secret".into() },
            },
        );

        let err = handler.handle(&generate_job(), &ctx(1, false)).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.get(EntityId::new(1)).unwrap().unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn missing_briefing_and_bad_payload_are_not_retried() {
        let handler = GenerateBriefingHandler::new(Arc::new(InMemoryBriefingStore::new()), StubGenerator::new());

        let missing = handler.handle(&generate_job(), &ctx(1, false)).unwrap_err();
        assert!(matches!(missing, JobError::NotFound(_)));

        let garbage = job(TASK_GENERATE_BRIEFING, &serde_json::json!({"briefing": "x"}));
        assert!(matches!(handler.handle(&garbage, &ctx(1, false)), Err(JobError::Validation(_))));
    }

    fn execute_job(target_name: &str) -> Job {
        let mut settings = Settings::new();
        settings.insert("topic".into(), serde_json::json!("rust"));
        job(
            TASK_EXECUTE_PLUGIN,
            &ExecutePayload {
                target_id: TargetId::new(3),
                owner_id: OwnerId::new(9),
                target_name: target_name.into(),
                settings,
            },
        )
    }

    #[test]
    fn execute_publishes_and_marks_processing() {
        let runs = Arc::new(InMemoryRunStore::new());
        let log = Arc::new(InMemoryStreamLog::new());
        let handler = ExecutePluginHandler::new(runs.clone(), Producer::new(log.clone()));

        let payload: ExecutePayload = serde_json::from_value(execute_job("news").payload).unwrap();
        let id = handler.execute(payload).unwrap();

        let run = runs.get(&id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Processing);
        assert_eq!(run.input["topic"], "rust");

        log.ensure_group(REQUEST_STREAM, "executor").unwrap();
        let entries = log
            .read_group(REQUEST_STREAM, "executor", "e1", firstsip_streams::ReadFrom::New, 10, Duration::ZERO)
            .unwrap();
        assert_eq!(entries.len(), 1);
        let message = firstsip_streams::StreamMessage::from_fields(&entries[0].fields).unwrap();
        let request: ExecutionRequest = message.decode_payload().unwrap();
        assert_eq!(request.correlation_id, id);
        assert_eq!(request.target_name, "news");
    }

    struct DownPublisher;

    impl RequestPublisher for DownPublisher {
        fn publish(&self, _request: &ExecutionRequest) -> Result<String, StreamError> {
            Err(StreamError::Command("connection refused".into()))
        }
    }

    #[test]
    fn publish_failure_fails_the_run_and_retries() {
        let runs = Arc::new(InMemoryRunStore::new());
        let handler = ExecutePluginHandler::new(runs.clone(), DownPublisher);

        let err = handler.handle(&execute_job("news"), &ctx(1, false)).unwrap_err();

        assert!(err.is_retryable());
        // The attempt's record is failed, not left pending.
        assert_eq!(runs.len(), 1);
        assert_eq!(runs.count_by_status(RunStatus::Failed), 1);
    }

    #[test]
    fn empty_target_name_is_rejected() {
        let handler = ExecutePluginHandler::new(Arc::new(InMemoryRunStore::new()), DownPublisher);
        assert!(matches!(
            handler.handle(&execute_job(" "), &ctx(1, false)),
            Err(JobError::Validation(_))
        ));
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TargetId>>);

    impl ExecutionEnqueuer for Recorder {
        fn enqueue_execute(
            &self,
            target_id: TargetId,
            _owner_id: OwnerId,
            _target_name: &str,
            _settings: Settings,
        ) -> Result<EnqueueOutcome, EnqueueError> {
            self.0.lock().unwrap().push(target_id);
            Ok(EnqueueOutcome::Accepted(JobId::new()))
        }
    }

    #[test]
    fn tick_evaluates_at_its_boundary() {
        let entry = firstsip_core::ScheduleEntry {
            owner_id: OwnerId::new(1),
            target_id: TargetId::new(5),
            target_name: "weather".into(),
            cron_expr: "0 9 * * *".into(),
            timezone: "UTC".into(),
            enabled: true,
            settings: Settings::new(),
        };
        let recorder = Arc::new(Recorder::default());
        let handler = SchedulerTickHandler::new(SchedulerTick::new(
            InMemoryScheduleSource::with_entries(vec![entry]),
            Arc::new(InMemoryScheduleCache::new()),
            recorder.clone(),
            CronEvaluator::default(),
        ));

        // 2026-01-19T09:00:00Z
        let boundary = DateTime::from_timestamp(1_768_813_200, 0).unwrap();
        handler
            .handle(&job(TASK_SCHEDULER_TICK, &TickPayload { boundary }), &ctx(1, true))
            .unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![TargetId::new(5)]);
    }
}
