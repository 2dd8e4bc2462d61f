use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use firstsip_core::{Briefing, EntityId, OwnerId, RunStatus, Settings, TargetId};
use firstsip_infra::config::WorkerConfig;
use firstsip_infra::generator::StubGenerator;
use firstsip_infra::jobs::ExecutionEnqueuer;
use firstsip_infra::read_model::{BriefingStore, RunStore};
use firstsip_streams::{
    ExecutionRequest, ExecutionResult, Producer, ReadFrom, StreamLog, StreamMessage,
};
use firstsip_worker::app::{InMemoryBackends, Worker};

fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.concurrency = 2;
    config.shutdown_timeout = Duration::from_secs(2);
    config.streams.block = Duration::from_millis(20);
    config.streams.io_timeout = Duration::from_millis(200);
    config
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

/// Answer every pending execution request with a completed result.
fn answer_requests(backends: &InMemoryBackends, config: &WorkerConfig) -> usize {
    let log = &backends.log;
    let requests = &config.streams.request_stream;
    log.ensure_group(requests, "executor").unwrap();
    let entries = log
        .read_group(requests, "executor", "executor-1", ReadFrom::New, 10, Duration::ZERO)
        .unwrap();

    let producer = Producer::new(log.clone()).with_stream(&config.streams.result_stream);
    for entry in &entries {
        let request: ExecutionRequest = StreamMessage::from_fields(&entry.fields)
            .unwrap()
            .decode_payload()
            .unwrap();
        let result = ExecutionResult {
            correlation_id: request.correlation_id.clone(),
            status: "completed".into(),
            output: Some(format!("ran {}", request.target_name)),
            error: None,
        };
        producer.publish_message(request.correlation_id, &result).unwrap();
        log.ack(requests, "executor", std::slice::from_ref(&entry.id)).unwrap();
    }
    entries.len()
}

#[test]
fn worker_generates_briefings_and_completes_plugin_runs() {
    let config = test_config();
    let backends = InMemoryBackends::new();
    backends
        .briefings
        .insert(Briefing::pending(EntityId::new(1), OwnerId::new(5)));

    let services = backends.services(Arc::new(StubGenerator::new()));
    let client = services.client();
    let worker = Worker::start(services, &config).unwrap();

    client.enqueue_generate(EntityId::new(1)).unwrap();
    client
        .enqueue_execute(TargetId::new(9), OwnerId::new(5), "news", Settings::new())
        .unwrap();

    wait_for("generated briefing", || {
        backends.briefings.get(EntityId::new(1)).unwrap().unwrap().status == RunStatus::Completed
    });

    let mut answered = 0;
    wait_for("execution request", || {
        answered += answer_requests(&backends, &config);
        answered == 1
    });

    wait_for("projected run", || {
        backends.runs.count_by_status(RunStatus::Completed) == 1
    });

    let briefing = backends.briefings.get(EntityId::new(1)).unwrap().unwrap();
    assert!(briefing.content.is_some());
    assert!(briefing.generated_at.is_some());
    assert_eq!(backends.runs.len(), 1);

    wait_for("job stats", || worker.stats().jobs_succeeded >= 2);
    assert_eq!(worker.stats().jobs_dead_lettered, 0);

    worker.shutdown();
}

#[test]
fn shutdown_returns_while_idle() {
    let config = test_config();
    let backends = InMemoryBackends::new();
    let worker = Worker::start(backends.services(Arc::new(StubGenerator::new())), &config).unwrap();

    let started = Instant::now();
    worker.shutdown();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(backends.runs.is_empty());
}
