//! Result consumer: reads executor results and projects them onto run records.

use tracing::info;

use firstsip_streams::{
    Consumer, ConsumerConfig, ConsumerHandle, ExecutionResult, StreamError, StreamLog,
};

use crate::config::StreamsConfig;
use crate::projections::status::StatusProjector;
use crate::read_model::runs::RunStore;

pub type ResultConsumer<L, R> = Consumer<L, ExecutionResult, StatusProjector<R>>;

/// Consumer settings for the result stream.
pub fn consumer_config(streams: &StreamsConfig) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(
        &streams.result_stream,
        &streams.result_group,
        &streams.consumer_name,
    );
    config.block = streams.block;
    config.io_timeout = streams.io_timeout;
    config.reclaim_idle = streams.reclaim_idle;
    config
}

/// Join the result group. Fails on invalid settings or when the group
/// cannot be created.
pub fn build<L, R>(log: L, runs: R, streams: &StreamsConfig) -> Result<ResultConsumer<L, R>, StreamError>
where
    L: StreamLog,
    R: RunStore,
{
    Consumer::new(log, StatusProjector::new(runs), consumer_config(streams))
}

pub fn spawn<L, R>(log: L, runs: R, streams: &StreamsConfig) -> Result<ConsumerHandle, StreamError>
where
    L: StreamLog + 'static,
    R: RunStore + 'static,
{
    let consumer = build(log, runs, streams)?;
    info!(
        stream = %streams.result_stream,
        group = %streams.result_group,
        consumer = %streams.consumer_name,
        "result consumer starting"
    );
    Ok(consumer.spawn("result-consumer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use firstsip_core::{CorrelationId, OwnerId, RunRecord, RunStatus, TargetId};
    use firstsip_streams::{InMemoryStreamLog, Producer};

    use crate::config::WorkerConfig;
    use crate::read_model::runs::InMemoryRunStore;

    fn streams() -> StreamsConfig {
        let mut s = WorkerConfig::default().streams;
        s.block = Duration::from_millis(10);
        s.io_timeout = Duration::from_millis(100);
        s
    }

    fn processing_run(runs: &InMemoryRunStore) -> CorrelationId {
        let id = CorrelationId::generate();
        let mut run = RunRecord::pending(id.clone(), OwnerId::new(1), TargetId::new(2), serde_json::json!({}), Utc::now());
        run.mark_processing().unwrap();
        runs.create(&run).unwrap();
        id
    }

    fn report(log: &Arc<InMemoryStreamLog>, stream: &str, id: &CorrelationId, status: &str) {
        let result = ExecutionResult {
            correlation_id: id.clone(),
            status: status.into(),
            output: Some("summary".into()),
            error: None,
        };
        Producer::new(log.clone())
            .with_stream(stream)
            .publish_message(id.clone(), &result)
            .unwrap();
    }

    #[test]
    fn results_complete_runs() {
        let log = Arc::new(InMemoryStreamLog::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let cfg = streams();
        let consumer = build(log.clone(), runs.clone(), &cfg).unwrap();

        let id = processing_run(&runs);
        report(&log, &cfg.result_stream, &id, "completed");
        // Redelivered duplicate.
        report(&log, &cfg.result_stream, &id, "failed");

        let stats = consumer.poll_once().unwrap();
        assert_eq!(stats.acked, 2);

        let run = runs.get(&id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output.as_deref(), Some("summary"));
    }

    #[test]
    fn orphaned_results_are_dead_lettered() {
        let log = Arc::new(InMemoryStreamLog::new());
        let cfg = streams();
        let consumer = build(log.clone(), Arc::new(InMemoryRunStore::new()), &cfg).unwrap();

        report(&log, &cfg.result_stream, &CorrelationId::generate(), "completed");
        let stats = consumer.poll_once().unwrap();

        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(log.len(&firstsip_streams::dead_letter_stream(&cfg.result_stream)), 1);
        assert_eq!(log.pending_count(&cfg.result_stream, &cfg.result_group).unwrap(), 0);
    }

    #[test]
    fn block_must_stay_below_io_timeout() {
        let mut cfg = streams();
        cfg.block = cfg.io_timeout;
        let err = build(Arc::new(InMemoryStreamLog::new()), Arc::new(InMemoryRunStore::new()), &cfg);
        assert!(matches!(err, Err(StreamError::Config(_))));
    }

    #[test]
    fn spawned_consumer_stops_on_shutdown() {
        let log = Arc::new(InMemoryStreamLog::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let cfg = streams();
        let id = processing_run(&runs);
        report(&log, &cfg.result_stream, &id, "failed");

        let handle = spawn(log, runs.clone(), &cfg).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runs.get(&id).unwrap().unwrap().status != RunStatus::Failed && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        assert_eq!(runs.get(&id).unwrap().unwrap().status, RunStatus::Failed);
    }
}
