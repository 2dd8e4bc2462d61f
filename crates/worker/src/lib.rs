//! Worker process: wires the job server, tick registrar and result consumer
//! over either in-memory or persistent stores.

pub mod app;
