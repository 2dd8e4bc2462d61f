use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use firstsip_core::{Briefing, EntityId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BriefingStoreError {
    #[error("briefing not found: {0}")]
    NotFound(EntityId),
    #[error("briefing storage error: {0}")]
    Storage(String),
}

/// Briefing rows as seen by the generate handler.
pub trait BriefingStore: Send + Sync {
    fn get(&self, id: EntityId) -> Result<Option<Briefing>, BriefingStoreError>;

    /// Persist status, content, error and generation time of an existing row.
    fn save(&self, briefing: &Briefing) -> Result<(), BriefingStoreError>;
}

impl<S> BriefingStore for Arc<S>
where
    S: BriefingStore + ?Sized,
{
    fn get(&self, id: EntityId) -> Result<Option<Briefing>, BriefingStoreError> {
        (**self).get(id)
    }

    fn save(&self, briefing: &Briefing) -> Result<(), BriefingStoreError> {
        (**self).save(briefing)
    }
}

/// In-memory briefing store for tests/dev. Rows are created with [`insert`](Self::insert).
#[derive(Debug, Default)]
pub struct InMemoryBriefingStore {
    inner: RwLock<HashMap<EntityId, Briefing>>,
}

impl InMemoryBriefingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, briefing: Briefing) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(briefing.id, briefing);
        }
    }
}

impl BriefingStore for InMemoryBriefingStore {
    fn get(&self, id: EntityId) -> Result<Option<Briefing>, BriefingStoreError> {
        let map = self
            .inner
            .read()
            .map_err(|_| BriefingStoreError::Storage("briefing store lock poisoned".into()))?;
        Ok(map.get(&id).cloned())
    }

    fn save(&self, briefing: &Briefing) -> Result<(), BriefingStoreError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| BriefingStoreError::Storage("briefing store lock poisoned".into()))?;
        match map.get_mut(&briefing.id) {
            Some(row) => {
                *row = briefing.clone();
                Ok(())
            }
            None => Err(BriefingStoreError::NotFound(briefing.id)),
        }
    }
}
