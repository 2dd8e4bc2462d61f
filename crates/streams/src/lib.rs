//! `firstsip-streams`: message bridge mechanics.
//!
//! Execution requests leave the process on a capped, append-only stream and
//! results come back on another one, read through a consumer group.
//!
//! - [`StreamLog`] abstracts the stream backend (Redis in production, [`InMemoryStreamLog`] in tests)
//! - [`Producer`] appends requests
//! - [`Consumer`] reads a group, acknowledges only after its handler succeeds,
//!   and reclaims entries left pending by crashed consumers

pub mod consumer;
pub mod in_memory;
pub mod log;
pub mod message;
pub mod producer;

pub use consumer::{
    Consumer, ConsumerConfig, ConsumerHandle, Delivery, HandlerError, MessageHandler, PollStats,
};
pub use in_memory::InMemoryStreamLog;
pub use log::{ReadFrom, StreamEntry, StreamError, StreamLog};
pub use message::{
    DEFAULT_MAX_LEN, DEFAULT_RESULT_GROUP, ExecutionRequest, ExecutionResult, REQUEST_STREAM,
    RESULT_STREAM, SCHEMA_VERSION, StreamMessage, dead_letter_stream,
};
pub use producer::{Producer, RequestPublisher};
