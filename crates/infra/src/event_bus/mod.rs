//! Infrastructure-backed composite sinks.
//!
//! The bus abstraction lives in `docreduce-events` as pure mechanics; this
//! module provides backends that need IO (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisPubSubSink, RedisSinkError};
