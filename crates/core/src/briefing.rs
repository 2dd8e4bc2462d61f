//! Generated daily briefings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreResult;
use crate::id::{EntityId, OwnerId};
use crate::status::RunStatus;

/// A briefing row. Only the generate job handler mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Briefing {
    pub id: EntityId,
    pub owner_id: OwnerId,
    pub status: RunStatus,
    pub content: Option<JsonValue>,
    pub error: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl Briefing {
    pub fn pending(id: EntityId, owner_id: OwnerId) -> Self {
        Self {
            id,
            owner_id,
            status: RunStatus::Pending,
            content: None,
            error: None,
            generated_at: None,
        }
    }

    pub fn mark_processing(&mut self) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Processing)?;
        Ok(())
    }

    pub fn complete(&mut self, content: JsonValue, at: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Completed)?;
        self.content = Some(content);
        self.error = None;
        self.generated_at = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> CoreResult<()> {
        self.status = self.status.transition(RunStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }
}
