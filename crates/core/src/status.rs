//! Persisted status state machine shared by run records and briefings.
//!
//! ```text
//! pending ──► processing ──► completed
//!    │             └───────► failed
//!    └──────────────────────► completed | failed
//! ```
//!
//! Transitions are monotonic: a terminal status accepts no further writes.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether `self -> next` is allowed. Re-asserting a non-terminal status is a no-op.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (RunStatus::Processing, RunStatus::Pending) => false,
            _ => true,
        }
    }

    /// Validate a transition and return the new status.
    pub fn transition(self, next: RunStatus) -> CoreResult<RunStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "processing" => Ok(RunStatus::Processing),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}
