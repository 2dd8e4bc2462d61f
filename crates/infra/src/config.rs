//! Worker configuration loaded from environment variables.

use std::time::Duration;

use thiserror::Error;

use firstsip_streams::{DEFAULT_MAX_LEN, DEFAULT_RESULT_GROUP, REQUEST_STREAM, RESULT_STREAM};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

/// External briefing generator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub url: Option<String>,
    pub secret: Option<String>,
    /// Return canned content instead of calling the generator.
    pub stub: bool,
}

/// Message bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamsConfig {
    pub request_stream: String,
    pub result_stream: String,
    pub result_group: String,
    /// Stable across restarts so the consumer can recover its own pending entries.
    pub consumer_name: String,
    pub max_len: usize,
    pub block: Duration,
    pub io_timeout: Duration,
    pub reclaim_idle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    pub concurrency: usize,
    pub shutdown_timeout: Duration,
    pub scheduler_tick: Duration,
    pub generator: GeneratorConfig,
    pub streams: StreamsConfig,
    pub log_level: String,
    pub log_format: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            database_url: None,
            use_persistent_stores: false,
            concurrency: 5,
            shutdown_timeout: Duration::from_secs(30),
            scheduler_tick: Duration::from_secs(60),
            generator: GeneratorConfig {
                url: None,
                secret: None,
                stub: true,
            },
            streams: StreamsConfig {
                request_stream: REQUEST_STREAM.to_string(),
                result_stream: RESULT_STREAM.to_string(),
                result_group: DEFAULT_RESULT_GROUP.to_string(),
                consumer_name: "briefing-worker-1".to_string(),
                max_len: DEFAULT_MAX_LEN,
                block: Duration::from_millis(5_000),
                io_timeout: Duration::from_millis(10_000),
                reclaim_idle: Duration::from_secs(300),
            },
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let use_persistent_stores = match get("USE_PERSISTENT_STORES") {
            Some(v) => parse_bool("USE_PERSISTENT_STORES", &v)?,
            None => false,
        };
        let redis_url = get("REDIS_URL");
        let database_url = get("DATABASE_URL");

        if use_persistent_stores {
            if redis_url.is_none() {
                return Err(ConfigError::Missing("REDIS_URL"));
            }
            if database_url.is_none() {
                return Err(ConfigError::Missing("DATABASE_URL"));
            }
        }

        let concurrency = parse_or(&get, "WORKER_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "0", "must be positive"));
        }

        let shutdown_timeout = secs_or(&get, "SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout)?;
        let scheduler_tick = secs_or(&get, "SCHEDULER_TICK_SECS", defaults.scheduler_tick)?;
        if scheduler_tick.is_zero() {
            return Err(invalid("SCHEDULER_TICK_SECS", "0", "must be positive"));
        }

        let generator_url = get("GENERATOR_URL");
        let stub = match get("GENERATOR_STUB") {
            Some(v) => parse_bool("GENERATOR_STUB", &v)?,
            None => generator_url.is_none(),
        };
        let generator = GeneratorConfig {
            url: generator_url,
            secret: get("GENERATOR_SECRET"),
            stub,
        };

        let d = defaults.streams;
        let streams = StreamsConfig {
            request_stream: get("REQUEST_STREAM").unwrap_or(d.request_stream),
            result_stream: get("RESULT_STREAM").unwrap_or(d.result_stream),
            result_group: get("RESULT_GROUP").unwrap_or(d.result_group),
            consumer_name: get("CONSUMER_NAME").unwrap_or(d.consumer_name),
            max_len: parse_or(&get, "STREAM_MAX_LEN", d.max_len)?,
            block: millis_or(&get, "STREAM_BLOCK_MS", d.block)?,
            io_timeout: millis_or(&get, "STREAM_IO_TIMEOUT_MS", d.io_timeout)?,
            reclaim_idle: secs_or(&get, "RECLAIM_IDLE_SECS", d.reclaim_idle)?,
        };
        if streams.block >= streams.io_timeout {
            return Err(invalid(
                "STREAM_BLOCK_MS",
                &streams.block.as_millis().to_string(),
                "must be shorter than STREAM_IO_TIMEOUT_MS",
            ));
        }

        Ok(Self {
            redis_url,
            database_url,
            use_persistent_stores,
            concurrency,
            shutdown_timeout,
            scheduler_tick,
            generator,
            streams,
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: get("LOG_FORMAT").unwrap_or(defaults.log_format),
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}

fn parse_or<G, T>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match get(var) {
        Some(v) => v.parse::<T>().map_err(|e| invalid(var, &v, e.to_string())),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, var, default.as_secs()).map(Duration::from_secs)
}

fn millis_or<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, var, default.as_millis() as u64).map(Duration::from_millis)
}
