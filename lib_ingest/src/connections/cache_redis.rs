//! # Redis Cache Implementation
//!
//! Backs the recent-readings cache with Redis lists. One
//! `ConnectionManager` is shared by all workers: it multiplexes commands over
//! a single connection and reconnects on its own, and cloning it is cheap.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::configs::CacheConfig;
use crate::connections::sink::{CacheKey, CacheSink};
use crate::error::SinkError;

/// A handler for Redis cache interactions.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Opens the client and establishes the managed connection.
    ///
    /// # Arguments
    /// * `config` - Host, port and logical database of the Redis server.
    pub async fn connect(config: &CacheConfig) -> Result<Self, SinkError> {
        let client = Client::open(config.url())?;
        let manager = ConnectionManager::new(client).await?;
        tracing::info!(host = %config.host, port = config.port, db = config.db, "connected to redis");
        Ok(Self { manager })
    }

    /// Round-trips a `PING` to verify the server is reachable.
    pub async fn ping(&self) -> Result<(), SinkError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

impl CacheSink for RedisCache {
    async fn push_front(&self, key: &CacheKey, entry: &str) -> Result<(), SinkError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.lpush(key.as_str(), entry).await?;
        Ok(())
    }

    async fn trim(&self, key: &CacheKey, start: isize, stop: isize) -> Result<(), SinkError> {
        let mut conn = self.manager.clone();
        let _: () = conn.ltrim(key.as_str(), start, stop).await?;
        Ok(())
    }

    async fn range(&self, key: &CacheKey, start: isize, stop: isize) -> Result<Vec<String>, SinkError> {
        let mut conn = self.manager.clone();
        Ok(conn.lrange(key.as_str(), start, stop).await?)
    }
}
