//! Consumer-group reader.
//!
//! Delivery rules:
//!
//! - undecodable entries are logged and left unacknowledged
//! - handler success acknowledges
//! - [`HandlerError::Retry`] leaves the entry pending so it is redelivered
//! - [`HandlerError::Terminal`], and entries delivered more than
//!   `max_deliveries` times, are copied to `<stream>:dlq` and acknowledged
//!
//! Pending entries are picked up twice: on start the consumer re-reads its own
//! pending list, and a periodic reclaim pass claims entries idle for longer
//! than `reclaim_idle` from any consumer of the group.

use std::marker::PhantomData;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::log::{ReadFrom, StreamEntry, StreamError, StreamLog};
use crate::message::{StreamMessage, dead_letter_stream};

/// Pause after a failed read before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Leave the entry pending; it will be delivered again.
    #[error("retryable handler failure: {0}")]
    Retry(String),

    /// Never retry; the entry is dead-lettered and acknowledged.
    #[error("terminal handler failure: {0}")]
    Terminal(String),
}

/// A decoded entry handed to a [`MessageHandler`].
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub entry_id: String,
    pub delivery_count: u64,
    pub message: StreamMessage,
    pub payload: T,
}

/// Processes decoded entries. Must be idempotent: delivery is at-least-once.
pub trait MessageHandler<T>: Send + Sync {
    fn handle(&self, delivery: &Delivery<T>) -> Result<(), HandlerError>;
}

impl<T, F> MessageHandler<T> for F
where
    F: Fn(&Delivery<T>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, delivery: &Delivery<T>) -> Result<(), HandlerError> {
        self(delivery)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    /// Block timeout of a group read; must stay below `io_timeout`.
    pub block: Duration,
    /// Read timeout of the backend connection.
    pub io_timeout: Duration,
    pub reclaim_idle: Duration,
    pub reclaim_interval: Duration,
    pub max_deliveries: u64,
}

impl ConsumerConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 10,
            block: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
            reclaim_idle: Duration::from_secs(300),
            reclaim_interval: Duration::from_secs(60),
            max_deliveries: 5,
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.stream.trim().is_empty()
            || self.group.trim().is_empty()
            || self.consumer.trim().is_empty()
        {
            return Err(StreamError::Config(
                "stream, group and consumer names must be non-empty".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(StreamError::Config("batch_size must be positive".into()));
        }
        if self.block >= self.io_timeout {
            return Err(StreamError::Config(format!(
                "block timeout ({:?}) must be shorter than the io timeout ({:?})",
                self.block, self.io_timeout
            )));
        }
        if self.max_deliveries == 0 {
            return Err(StreamError::Config("max_deliveries must be positive".into()));
        }
        Ok(())
    }

    pub fn dead_letter_stream(&self) -> String {
        dead_letter_stream(&self.stream)
    }
}

/// Counters for one read/reclaim pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub read: usize,
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub undecodable: usize,
}

impl PollStats {
    pub fn merge(&mut self, other: PollStats) {
        self.read += other.read;
        self.acked += other.acked;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.undecodable += other.undecodable;
    }

    fn settled(&self) -> usize {
        self.acked + self.dead_lettered
    }
}

pub struct Consumer<L, T, H> {
    log: L,
    handler: H,
    config: ConsumerConfig,
    _payload: PhantomData<fn() -> T>,
}

impl<L, T, H> Consumer<L, T, H>
where
    L: StreamLog,
    T: DeserializeOwned,
    H: MessageHandler<T>,
{
    /// Validate `config` and create the group if it does not exist yet.
    pub fn new(log: L, handler: H, config: ConsumerConfig) -> Result<Self, StreamError> {
        config.validate()?;
        log.ensure_group(&config.stream, &config.group)?;
        Ok(Self {
            log,
            handler,
            config,
            _payload: PhantomData,
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// One blocking read of new entries.
    pub fn poll_once(&self) -> Result<PollStats, StreamError> {
        let entries = self.log.read_group(
            &self.config.stream,
            &self.config.group,
            &self.config.consumer,
            ReadFrom::New,
            self.config.batch_size,
            self.config.block,
        )?;
        Ok(self.process_batch(entries))
    }

    /// Re-process entries this consumer read before a restart but never acknowledged.
    ///
    /// Stops as soon as a batch settles nothing, so entries that keep failing
    /// stay pending for the reclaim pass.
    pub fn recover_pending(&self) -> Result<PollStats, StreamError> {
        let mut total = PollStats::default();
        loop {
            let entries = self.log.read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                ReadFrom::Pending,
                self.config.batch_size,
                Duration::ZERO,
            )?;
            if entries.is_empty() {
                break;
            }
            let stats = self.process_batch(entries);
            total.merge(stats);
            if stats.settled() == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Claim and process entries left pending in the group longer than `reclaim_idle`.
    pub fn reclaim(&self) -> Result<PollStats, StreamError> {
        let entries = self.log.claim_stale(
            &self.config.stream,
            &self.config.group,
            &self.config.consumer,
            self.config.reclaim_idle,
            self.config.batch_size,
        )?;
        if !entries.is_empty() {
            info!(
                stream = %self.config.stream,
                group = %self.config.group,
                consumer = %self.config.consumer,
                claimed = entries.len(),
                "reclaimed stale pending entries"
            );
        }
        Ok(self.process_batch(entries))
    }

    /// Consume until a shutdown signal arrives (or its sender is dropped).
    pub fn run(&self, shutdown: mpsc::Receiver<()>) {
        if let Err(err) = self.recover_pending() {
            error!(stream = %self.config.stream, error = %err, "pending recovery failed");
        }

        let mut last_reclaim = Instant::now();
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {}
            }

            if last_reclaim.elapsed() >= self.config.reclaim_interval {
                if let Err(err) = self.reclaim() {
                    error!(stream = %self.config.stream, error = %err, "reclaim pass failed");
                }
                last_reclaim = Instant::now();
            }

            if let Err(err) = self.poll_once() {
                error!(stream = %self.config.stream, error = %err, "failed to read from stream");
                match shutdown.recv_timeout(ERROR_BACKOFF) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        }

        info!(
            stream = %self.config.stream,
            consumer = %self.config.consumer,
            "consumer stopped"
        );
    }

    fn process_batch(&self, entries: Vec<StreamEntry>) -> PollStats {
        let mut stats = PollStats::default();
        for entry in entries {
            self.process_entry(entry, &mut stats);
        }
        stats
    }

    fn process_entry(&self, entry: StreamEntry, stats: &mut PollStats) {
        stats.read += 1;

        if entry.delivery_count > self.config.max_deliveries {
            let reason = format!("delivered {} times", entry.delivery_count);
            self.dead_letter(&entry, &reason, stats);
            return;
        }

        let decoded = StreamMessage::from_fields(&entry.fields)
            .and_then(|message| message.decode_payload::<T>().map(|payload| (message, payload)));
        let (message, payload) = match decoded {
            Ok(pair) => pair,
            Err(err) => {
                warn!(
                    stream = %self.config.stream,
                    entry_id = %entry.id,
                    error = %err,
                    "undecodable stream entry left pending"
                );
                stats.undecodable += 1;
                return;
            }
        };

        let delivery = Delivery {
            entry_id: entry.id.clone(),
            delivery_count: entry.delivery_count,
            message,
            payload,
        };

        match self.handler.handle(&delivery) {
            Ok(()) => {
                if self.ack(&entry.id) {
                    stats.acked += 1;
                }
            }
            Err(HandlerError::Retry(reason)) => {
                warn!(
                    stream = %self.config.stream,
                    entry_id = %entry.id,
                    correlation_id = %delivery.message.correlation_id,
                    error = %reason,
                    "handler failed; entry stays pending"
                );
                stats.retried += 1;
            }
            Err(HandlerError::Terminal(reason)) => {
                self.dead_letter(&entry, &reason, stats);
            }
        }
    }

    fn ack(&self, id: &str) -> bool {
        match self
            .log
            .ack(&self.config.stream, &self.config.group, &[id.to_string()])
        {
            Ok(_) => true,
            Err(err) => {
                error!(stream = %self.config.stream, entry_id = %id, error = %err, "failed to ack entry");
                false
            }
        }
    }

    fn dead_letter(&self, entry: &StreamEntry, reason: &str, stats: &mut PollStats) {
        let dlq = self.config.dead_letter_stream();
        let mut fields = entry.fields.clone();
        fields.push(("original_id".to_string(), entry.id.clone()));
        fields.push(("delivery_count".to_string(), entry.delivery_count.to_string()));
        fields.push(("reason".to_string(), reason.to_string()));
        fields.push(("dead_lettered_at".to_string(), Utc::now().timestamp().to_string()));

        if let Err(err) = self.log.append(&dlq, &fields, None) {
            // Not acked: the entry is retried by a later reclaim pass.
            error!(stream = %dlq, entry_id = %entry.id, error = %err, "dead-letter append failed");
            return;
        }

        warn!(
            stream = %self.config.stream,
            dead_letter_stream = %dlq,
            entry_id = %entry.id,
            delivery_count = entry.delivery_count,
            reason = %reason,
            "entry moved to dead-letter stream"
        );
        if self.ack(&entry.id) {
            stats.dead_lettered += 1;
        }
    }
}

impl<L, T, H> Consumer<L, T, H>
where
    L: StreamLog + 'static,
    T: DeserializeOwned + 'static,
    H: MessageHandler<T> + 'static,
{
    /// Run the consumer loop on a dedicated thread.
    pub fn spawn(self, name: &str) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run(shutdown_rx))
            .expect("failed to spawn stream consumer thread");

        ConsumerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

/// Handle to stop and join a spawned consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Request shutdown and wait; returns after the in-flight read finishes.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
