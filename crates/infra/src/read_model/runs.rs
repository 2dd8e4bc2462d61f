use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use firstsip_core::{CorrelationId, RunRecord, RunStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    NotFound(CorrelationId),
    #[error("run already exists: {0}")]
    AlreadyExists(CorrelationId),
    #[error("run storage error: {0}")]
    Storage(String),
}

/// Persistence for run records.
///
/// `save_if_not_terminal` is the only update path: a record that is already
/// completed or failed is never overwritten, whatever the caller holds.
pub trait RunStore: Send + Sync {
    fn create(&self, run: &RunRecord) -> Result<(), RunStoreError>;

    fn get(&self, correlation_id: &CorrelationId) -> Result<Option<RunRecord>, RunStoreError>;

    /// Overwrite the stored record unless it is terminal. Returns whether it wrote.
    fn save_if_not_terminal(&self, run: &RunRecord) -> Result<bool, RunStoreError>;
}

impl<S> RunStore for Arc<S>
where
    S: RunStore + ?Sized,
{
    fn create(&self, run: &RunRecord) -> Result<(), RunStoreError> {
        (**self).create(run)
    }

    fn get(&self, correlation_id: &CorrelationId) -> Result<Option<RunRecord>, RunStoreError> {
        (**self).get(correlation_id)
    }

    fn save_if_not_terminal(&self, run: &RunRecord) -> Result<bool, RunStoreError> {
        (**self).save_if_not_terminal(run)
    }
}

/// In-memory run store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    inner: RwLock<HashMap<CorrelationId, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_by_status(&self, status: RunStatus) -> usize {
        self.inner
            .read()
            .map(|m| m.values().filter(|r| r.status == status).count())
            .unwrap_or(0)
    }
}

fn poisoned() -> RunStoreError {
    RunStoreError::Storage("run store lock poisoned".into())
}

impl RunStore for InMemoryRunStore {
    fn create(&self, run: &RunRecord) -> Result<(), RunStoreError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        if map.contains_key(&run.correlation_id) {
            return Err(RunStoreError::AlreadyExists(run.correlation_id.clone()));
        }
        map.insert(run.correlation_id.clone(), run.clone());
        Ok(())
    }

    fn get(&self, correlation_id: &CorrelationId) -> Result<Option<RunRecord>, RunStoreError> {
        let map = self.inner.read().map_err(|_| poisoned())?;
        Ok(map.get(correlation_id).cloned())
    }

    fn save_if_not_terminal(&self, run: &RunRecord) -> Result<bool, RunStoreError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        let stored = map
            .get_mut(&run.correlation_id)
            .ok_or_else(|| RunStoreError::NotFound(run.correlation_id.clone()))?;
        if stored.is_terminal() {
            return Ok(false);
        }
        *stored = run.clone();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use firstsip_core::{OwnerId, TargetId};

    fn run() -> RunRecord {
        RunRecord::pending(
            CorrelationId::generate(),
            OwnerId::new(1),
            TargetId::new(2),
            serde_json::json!({}),
            Utc::now(),
        )
    }

    #[test]
    fn create_is_unique() {
        let store = InMemoryRunStore::new();
        let r = run();
        store.create(&r).unwrap();
        assert_eq!(
            store.create(&r),
            Err(RunStoreError::AlreadyExists(r.correlation_id.clone()))
        );
        assert_eq!(store.get(&r.correlation_id).unwrap(), Some(r));
    }

    #[test]
    fn terminal_rows_are_not_overwritten() {
        let store = InMemoryRunStore::new();
        let mut r = run();
        store.create(&r).unwrap();

        r.complete("ok", Utc::now()).unwrap();
        assert!(store.save_if_not_terminal(&r).unwrap());

        let mut stale = run();
        stale.correlation_id = r.correlation_id.clone();
        stale.mark_processing().unwrap();
        assert!(!store.save_if_not_terminal(&stale).unwrap());

        let stored = store.get(&r.correlation_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.output.as_deref(), Some("ok"));
    }

    #[test]
    fn saving_unknown_run_is_not_found() {
        let store = InMemoryRunStore::new();
        assert!(matches!(
            store.save_if_not_terminal(&run()),
            Err(RunStoreError::NotFound(_))
        ));
    }
}
