//! # Connections Module
//!
//! This module handles the storage side of the pipeline: the sink contracts
//! the workers write through, and their implementations.

/// Cache and durable sink traits, and the typed cache key.
pub mod sink;

/// In-memory sinks with failure injection, for tests.
#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// Module for Redis cache operations and connection handling.
#[cfg(feature = "connections")]
pub mod cache_redis;

/// Module for PostgreSQL database connection pooling and management.
#[cfg(feature = "connections")]
pub mod db_postgres;

#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryCache, MemoryStore};
pub use sink::{recent_readings, CacheKey, CacheSink, DurableSink};

#[cfg(feature = "connections")]
pub use cache_redis::RedisCache;
#[cfg(feature = "connections")]
pub use db_postgres::{PostgresStore, PostgresWriter};
