//! Last-fire timestamps per (owner, target).
//!
//! Advisory only: a lost write can at worst re-fire an entry once, and a
//! missing value is handled by the evaluator's cold-start rule.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use firstsip_core::{schedule::cache_key, OwnerId, TargetId};

/// Redis hash holding `"{owner}:{target}" -> unix seconds`.
pub const LAST_RUN_HASH: &str = "scheduler:last_run";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("schedule cache unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt schedule cache value for {key}: {value:?}")]
    Corrupt { key: String, value: String },
}

pub trait ScheduleCache: Send + Sync {
    fn last_run(&self, owner_id: OwnerId, target_id: TargetId) -> Result<Option<DateTime<Utc>>, CacheError>;

    fn set_last_run(&self, owner_id: OwnerId, target_id: TargetId, at: DateTime<Utc>) -> Result<(), CacheError>;
}

impl<C> ScheduleCache for Arc<C>
where
    C: ScheduleCache + ?Sized,
{
    fn last_run(&self, owner_id: OwnerId, target_id: TargetId) -> Result<Option<DateTime<Utc>>, CacheError> {
        (**self).last_run(owner_id, target_id)
    }

    fn set_last_run(&self, owner_id: OwnerId, target_id: TargetId, at: DateTime<Utc>) -> Result<(), CacheError> {
        (**self).set_last_run(owner_id, target_id, at)
    }
}

/// Parse a stored unix-seconds value.
fn decode_timestamp(key: &str, raw: &str) -> Result<DateTime<Utc>, CacheError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| CacheError::Corrupt {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

/// In-memory cache for tests/dev. Stores the same unix-seconds encoding as Redis.
#[derive(Debug, Default)]
pub struct InMemoryScheduleCache {
    inner: RwLock<HashMap<String, String>>,
}

impl InMemoryScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw value (tests use this to simulate corrupt entries).
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(key.into(), value.into());
        }
    }
}

impl ScheduleCache for InMemoryScheduleCache {
    fn last_run(&self, owner_id: OwnerId, target_id: TargetId) -> Result<Option<DateTime<Utc>>, CacheError> {
        let key = cache_key(owner_id, target_id);
        let map = self
            .inner
            .read()
            .map_err(|_| CacheError::Unavailable("lock poisoned".into()))?;
        map.get(&key).map(|raw| decode_timestamp(&key, raw)).transpose()
    }

    fn set_last_run(&self, owner_id: OwnerId, target_id: TargetId, at: DateTime<Utc>) -> Result<(), CacheError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| CacheError::Unavailable("lock poisoned".into()))?;
        map.insert(cache_key(owner_id, target_id), at.timestamp().to_string());
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use redis_cache::RedisScheduleCache;

#[cfg(feature = "redis")]
mod redis_cache {
    use super::*;
    use tracing::instrument;

    /// `HGET`/`HSET` on [`LAST_RUN_HASH`].
    #[derive(Debug, Clone)]
    pub struct RedisScheduleCache {
        client: Arc<redis::Client>,
        hash_key: String,
    }

    fn unavailable(e: redis::RedisError) -> CacheError {
        CacheError::Unavailable(e.to_string())
    }

    impl RedisScheduleCache {
        pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
            let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
            Ok(Self {
                client: Arc::new(client),
                hash_key: LAST_RUN_HASH.to_string(),
            })
        }

        pub fn with_hash_key(mut self, hash_key: impl Into<String>) -> Self {
            self.hash_key = hash_key.into();
            self
        }
    }

    impl ScheduleCache for RedisScheduleCache {
        fn last_run(&self, owner_id: OwnerId, target_id: TargetId) -> Result<Option<DateTime<Utc>>, CacheError> {
            let key = cache_key(owner_id, target_id);
            let mut conn = self.client.get_connection().map_err(unavailable)?;
            let raw: Option<String> = redis::cmd("HGET")
                .arg(&self.hash_key)
                .arg(&key)
                .query(&mut conn)
                .map_err(unavailable)?;
            raw.map(|raw| decode_timestamp(&key, &raw)).transpose()
        }

        #[instrument(skip(self), err)]
        fn set_last_run(&self, owner_id: OwnerId, target_id: TargetId, at: DateTime<Utc>) -> Result<(), CacheError> {
            let mut conn = self.client.get_connection().map_err(unavailable)?;
            redis::cmd("HSET")
                .arg(&self.hash_key)
                .arg(cache_key(owner_id, target_id))
                .arg(at.timestamp())
                .query::<()>(&mut conn)
                .map_err(unavailable)
        }
    }
}
