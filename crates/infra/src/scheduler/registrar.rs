//! Periodic registration of the scheduler tick job.
//!
//! Every registrar enqueues the tick of each interval boundary under a dedupe
//! key embedding that boundary, so restarts and extra registrars collapse onto
//! one tick per interval.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::jobs::client::{EnqueueError, JobClient};
use crate::jobs::store::JobStore;
use crate::jobs::types::EnqueueOutcome;

/// First interval boundary strictly after `now`.
pub fn next_boundary(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.as_secs().max(1) as i64;
    let next = (now.timestamp().div_euclid(step) + 1) * step;
    DateTime::from_timestamp(next, 0).unwrap_or(now)
}

pub struct TickRegistrar<S> {
    client: JobClient<S>,
    interval: Duration,
}

impl<S: JobStore> TickRegistrar<S> {
    pub fn new(client: JobClient<S>, interval: Duration) -> Self {
        Self {
            client,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Enqueue the tick belonging to `boundary`.
    pub fn register(&self, boundary: DateTime<Utc>) -> Result<EnqueueOutcome, EnqueueError> {
        let outcome = self.client.enqueue_tick(boundary, self.interval)?;
        if outcome.is_duplicate() {
            debug!(%boundary, "tick already registered");
        }
        Ok(outcome)
    }

    /// Register one tick per boundary until shutdown is signalled.
    pub fn run(&self, shutdown: mpsc::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "tick registrar started");
        loop {
            let boundary = next_boundary(Utc::now(), self.interval);
            let wait = (boundary - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            match shutdown.recv_timeout(wait) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            if let Err(e) = self.register(boundary) {
                error!(%boundary, error = %e, "failed to register scheduler tick");
            }
        }
        info!("tick registrar stopped");
    }
}

impl<S: JobStore + 'static> TickRegistrar<S> {
    pub fn spawn(self, name: &str) -> RegistrarHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run(shutdown_rx))
            .expect("failed to spawn tick registrar thread");

        RegistrarHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

#[derive(Debug)]
pub struct RegistrarHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl RegistrarHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
