//! Broker side of the message bridge. The mechanics live in `firstsip-streams`;
//! this module supplies the Redis Streams backend.

#[cfg(feature = "redis")]
pub mod redis_log;

#[cfg(feature = "redis")]
pub use redis_log::RedisStreamLog;
