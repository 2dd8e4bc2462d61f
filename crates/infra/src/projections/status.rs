//! Status projector: applies executor results to run records.
//!
//! Idempotent under at-least-once delivery. A record that is already
//! completed or failed is left untouched and the result is reported as
//! applied, so redelivered results are acknowledged.

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use firstsip_core::{CoreError, CorrelationId, RunStatus};
use firstsip_streams::{Delivery, ExecutionResult, HandlerError, MessageHandler};

use crate::read_model::runs::{RunStore, RunStoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// No run record for this correlation id (orphaned result).
    #[error("no run record for {0}")]
    NotFound(CorrelationId),

    /// Result status is neither `completed` nor `failed`.
    #[error("invalid result status {0:?}")]
    InvalidStatus(String),

    #[error(transparent)]
    Transition(#[from] CoreError),

    #[error("run store error: {0}")]
    Store(String),
}

impl ProjectionError {
    /// Store failures may succeed on redelivery; everything else never will.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProjectionError::Store(_))
    }
}

impl From<RunStoreError> for ProjectionError {
    fn from(e: RunStoreError) -> Self {
        match e {
            RunStoreError::NotFound(id) => ProjectionError::NotFound(id),
            other => ProjectionError::Store(other.to_string()),
        }
    }
}

impl From<ProjectionError> for HandlerError {
    fn from(e: ProjectionError) -> Self {
        if e.is_retryable() {
            HandlerError::Retry(e.to_string())
        } else {
            HandlerError::Terminal(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(RunStatus),
    /// The record was already terminal; nothing was written.
    AlreadyTerminal(RunStatus),
}

fn parse_result_status(raw: &str) -> Result<RunStatus, ProjectionError> {
    match raw.trim() {
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        other => Err(ProjectionError::InvalidStatus(other.to_string())),
    }
}

#[derive(Debug)]
pub struct StatusProjector<R> {
    runs: R,
}

impl<R: RunStore> StatusProjector<R> {
    pub fn new(runs: R) -> Self {
        Self { runs }
    }

    pub fn runs(&self) -> &R {
        &self.runs
    }

    pub fn apply(&self, result: &ExecutionResult) -> Result<ApplyOutcome, ProjectionError> {
        let status = parse_result_status(&result.status)?;
        let id = &result.correlation_id;

        let mut run = self
            .runs
            .get(id)?
            .ok_or_else(|| ProjectionError::NotFound(id.clone()))?;

        if run.is_terminal() {
            debug!(correlation_id = %id, status = %run.status, "run already terminal; result ignored");
            return Ok(ApplyOutcome::AlreadyTerminal(run.status));
        }

        let now = Utc::now();
        match status {
            RunStatus::Completed => run.complete(result.output.clone().unwrap_or_default(), now)?,
            _ => run.fail(
                result
                    .error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "executor reported failure".to_string()),
                now,
            )?,
        }

        if !self.runs.save_if_not_terminal(&run)? {
            // Another writer reached a terminal state first.
            let current = self.runs.get(id)?.map(|r| r.status).unwrap_or(status);
            return Ok(ApplyOutcome::AlreadyTerminal(current));
        }

        info!(correlation_id = %id, status = %status, "run status updated");
        Ok(ApplyOutcome::Applied(status))
    }
}

impl<R: RunStore> MessageHandler<ExecutionResult> for StatusProjector<R> {
    fn handle(&self, delivery: &Delivery<ExecutionResult>) -> Result<(), HandlerError> {
        match self.apply(&delivery.payload) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    entry_id = %delivery.entry_id,
                    correlation_id = %delivery.payload.correlation_id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "failed to apply execution result"
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use firstsip_core::{OwnerId, RunRecord, TargetId};
    use proptest::prelude::*;

    use crate::read_model::runs::InMemoryRunStore;

    fn seeded(status: RunStatus) -> (StatusProjector<Arc<InMemoryRunStore>>, CorrelationId) {
        let store = Arc::new(InMemoryRunStore::new());
        let id = CorrelationId::generate();
        let mut run = RunRecord::pending(
            id.clone(),
            OwnerId::new(1),
            TargetId::new(2),
            serde_json::json!({}),
            Utc::now(),
        );
        match status {
            RunStatus::Processing => run.mark_processing().unwrap(),
            RunStatus::Completed => run.complete("earlier", Utc::now()).unwrap(),
            RunStatus::Failed => run.fail("earlier", Utc::now()).unwrap(),
            RunStatus::Pending => {}
        }
        store.create(&run).unwrap();
        (StatusProjector::new(store), id)
    }

    fn result(id: &CorrelationId, status: &str) -> ExecutionResult {
        ExecutionResult {
            correlation_id: id.clone(),
            status: status.to_string(),
            output: Some("digest".into()),
            error: Some("executor crashed".into()),
        }
    }

    #[test]
    fn completed_result_writes_output() {
        let (projector, id) = seeded(RunStatus::Processing);

        let outcome = projector.apply(&result(&id, "completed")).unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied(RunStatus::Completed));
        let run = projector.runs().get(&id).unwrap().unwrap();
        assert_eq!(run.output.as_deref(), Some("digest"));
        assert!(run.error.is_none());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn failed_result_writes_error() {
        let (projector, id) = seeded(RunStatus::Processing);
        projector.apply(&result(&id, "failed")).unwrap();

        let run = projector.runs().get(&id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("executor crashed"));
    }

    #[test]
    fn result_may_overtake_the_processing_write() {
        let (projector, id) = seeded(RunStatus::Pending);
        assert_eq!(
            projector.apply(&result(&id, "completed")).unwrap(),
            ApplyOutcome::Applied(RunStatus::Completed)
        );
    }

    #[test]
    fn terminal_record_is_a_no_op() {
        let (projector, id) = seeded(RunStatus::Failed);

        let outcome = projector.apply(&result(&id, "completed")).unwrap();

        assert_eq!(outcome, ApplyOutcome::AlreadyTerminal(RunStatus::Failed));
        let run = projector.runs().get(&id).unwrap().unwrap();
        assert_eq!(run.error.as_deref(), Some("earlier"));
        assert!(run.output.is_none());
    }

    #[test]
    fn invalid_status_and_orphans_are_terminal() {
        let (projector, id) = seeded(RunStatus::Processing);

        let err = projector.apply(&result(&id, "processing")).unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidStatus(_)));
        assert!(matches!(HandlerError::from(err), HandlerError::Terminal(_)));

        let orphan = projector
            .apply(&result(&CorrelationId::generate(), "completed"))
            .unwrap_err();
        assert!(matches!(orphan, ProjectionError::NotFound(_)));
        assert!(matches!(HandlerError::from(orphan), HandlerError::Terminal(_)));

        // The bad results left the record alone.
        assert_eq!(
            projector.runs().get(&id).unwrap().unwrap().status,
            RunStatus::Processing
        );
    }

    #[test]
    fn store_errors_are_retryable() {
        let err = ProjectionError::from(RunStoreError::Storage("connection reset".into()));
        assert!(matches!(HandlerError::from(err), HandlerError::Retry(_)));
    }

    proptest! {
        #[test]
        fn first_terminal_result_wins(statuses in proptest::collection::vec(
            prop_oneof![Just("completed"), Just("failed"), Just("running")],
            1..12,
        )) {
            let (projector, id) = seeded(RunStatus::Processing);
            let first = statuses
                .iter()
                .find(|s| **s != "running")
                .map(|s| if *s == "completed" { RunStatus::Completed } else { RunStatus::Failed });

            for status in &statuses {
                let _ = projector.apply(&result(&id, status));
            }

            let run = projector.runs().get(&id).unwrap().unwrap();
            prop_assert_eq!(run.status, first.unwrap_or(RunStatus::Processing));
        }
    }
}
