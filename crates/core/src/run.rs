//! Run records: one per plugin execution handed to the external executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreResult;
use crate::id::{CorrelationId, OwnerId, TargetId};
use crate::status::RunStatus;

/// Persisted record of a single plugin execution.
///
/// Created `pending` by the execute handler, moved to `processing` once the
/// request is on the stream, and to a terminal status by the status projector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub correlation_id: CorrelationId,
    pub owner_id: OwnerId,
    pub target_id: TargetId,
    pub status: RunStatus,
    /// Settings the run was started with.
    pub input: JsonValue,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn pending(
        correlation_id: CorrelationId,
        owner_id: OwnerId,
        target_id: TargetId,
        input: JsonValue,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            owner_id,
            target_id,
            status: RunStatus::Pending,
            input,
            output: None,
            error: None,
            started_at: Some(started_at),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_processing(&mut self) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Processing)?;
        Ok(())
    }

    pub fn complete(&mut self, output: impl Into<String>, at: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Completed)?;
        self.output = Some(output.into());
        self.error = None;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record() -> RunRecord {
        RunRecord::pending(
            CorrelationId::generate(),
            OwnerId::new(1),
            TargetId::new(7),
            serde_json::json!({"topic": "rust"}),
            Utc::now(),
        )
    }

    #[test]
    fn happy_path() {
        let mut run = record();
        run.mark_processing().unwrap();
        run.complete("digest", Utc::now()).unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output.as_deref(), Some("digest"));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn terminal_record_rejects_writes() {
        let mut run = record();
        run.fail("boom", Utc::now()).unwrap();
        let snapshot = run.clone();

        assert!(run.complete("late", Utc::now()).is_err());
        assert!(run.mark_processing().is_err());
        assert_eq!(run, snapshot);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Processing,
        Complete,
        Fail,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Processing), Just(Op::Complete), Just(Op::Fail)]
    }

    proptest! {
        #[test]
        fn status_never_leaves_a_terminal_state(ops in proptest::collection::vec(op(), 1..20)) {
            let mut run = record();
            let mut terminal: Option<RunStatus> = None;

            for op in ops {
                let _ = match op {
                    Op::Processing => run.mark_processing(),
                    Op::Complete => run.complete("out", Utc::now()),
                    Op::Fail => run.fail("err", Utc::now()),
                };
                match terminal {
                    Some(status) => prop_assert_eq!(run.status, status),
                    None if run.is_terminal() => terminal = Some(run.status),
                    None => {}
                }
            }
        }
    }
}
