use std::sync::{Arc, RwLock};

use firstsip_core::ScheduleEntry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("schedule source error: {0}")]
    Storage(String),
}

/// Where the scheduler tick reads schedule entries from.
pub trait ScheduleSource: Send + Sync {
    /// Every enabled entry with a non-empty cron expression.
    fn load_schedulable(&self) -> Result<Vec<ScheduleEntry>, SourceError>;
}

impl<S> ScheduleSource for Arc<S>
where
    S: ScheduleSource + ?Sized,
{
    fn load_schedulable(&self) -> Result<Vec<ScheduleEntry>, SourceError> {
        (**self).load_schedulable()
    }
}

/// In-memory schedule source for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryScheduleSource {
    entries: RwLock<Vec<ScheduleEntry>>,
}

impl InMemoryScheduleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<ScheduleEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Insert or replace the entry for the same (owner, target).
    pub fn upsert(&self, entry: ScheduleEntry) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|e| !(e.owner_id == entry.owner_id && e.target_id == entry.target_id));
            entries.push(entry);
        }
    }
}

impl ScheduleSource for InMemoryScheduleSource {
    fn load_schedulable(&self) -> Result<Vec<ScheduleEntry>, SourceError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SourceError::Storage("schedule source lock poisoned".into()))?;
        Ok(entries.iter().filter(|e| e.is_schedulable()).cloned().collect())
    }
}
