//! Stream backend abstraction (append-only log with consumer groups).
//!
//! The operations mirror the Redis stream commands the bridge needs:
//! `XADD MAXLEN ~`, `XGROUP CREATE MKSTREAM`, `XREADGROUP`, `XACK`,
//! `XPENDING` + `XCLAIM`. Backends must be safe to share between threads.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream connection error: {0}")]
    Connection(String),

    #[error("stream command error: {0}")]
    Command(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("consumer group {group} does not exist on {stream}")]
    NoGroup { stream: String, group: String },

    #[error("invalid stream configuration: {0}")]
    Config(String),
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to the group (`>`).
    New,
    /// Entries already delivered to this consumer and not yet acknowledged (`0`).
    Pending,
}

/// One entry returned by a group read or claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
    /// Times the entry has been delivered inside the group; 0 when unknown.
    pub delivery_count: u64,
}

pub trait StreamLog: Send + Sync {
    /// Append an entry and return its id. `max_len` trims the oldest entries
    /// (approximately) once exceeded.
    fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, StreamError>;

    /// Create `group` on `stream` starting at the beginning. Idempotent.
    fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError>;

    /// Read up to `count` entries for `consumer`.
    ///
    /// [`ReadFrom::New`] blocks for at most `block` when nothing is available
    /// and returns an empty batch on timeout. [`ReadFrom::Pending`] never blocks.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Acknowledge entries; returns how many were still pending.
    fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError>;

    /// Transfer to `consumer` up to `count` entries pending in the group for at
    /// least `min_idle`, whichever consumer held them.
    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Number of entries delivered to the group and not yet acknowledged.
    fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StreamError>;
}

impl<L> StreamLog for Arc<L>
where
    L: StreamLog + ?Sized,
{
    fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, StreamError> {
        (**self).append(stream, fields, max_len)
    }

    fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        (**self).ensure_group(stream, group)
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        (**self).read_group(stream, group, consumer, from, count, block)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        (**self).ack(stream, group, ids)
    }

    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        (**self).claim_stale(stream, group, consumer, min_idle, count)
    }

    fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        (**self).pending_count(stream, group)
    }
}
