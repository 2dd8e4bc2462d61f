//! Long-running background workers.

pub mod result_consumer;

pub use result_consumer::ResultConsumer;
