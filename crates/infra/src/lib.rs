//! Infrastructure layer of the background execution subsystem.
//!
//! - `jobs`: the job queue (client, server, in-memory and Redis stores)
//! - `scheduler`: cron evaluation, schedule cache, tick and registrar
//! - `bridge`: Redis Streams backend for the message bridge
//! - `read_model`: run and briefing stores (in-memory and Postgres)
//! - `projections`: the status projector
//! - `generator`: briefing content generation
//! - `handlers`: job handlers for the built-in job types
//! - `workers`: the result consumer
//! - `config`: environment configuration

pub mod bridge;
pub mod config;
pub mod generator;
pub mod handlers;
pub mod jobs;
pub mod projections;
pub mod read_model;
pub mod scheduler;
pub mod workers;
