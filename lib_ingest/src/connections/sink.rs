//! # Sink Contracts
//!
//! The two storage abstractions the workers write to. Both are expressed as
//! traits so the worker loop can run against Redis/PostgreSQL in production
//! and against the in-memory implementations in tests.

use std::fmt;
use std::future::Future;

use crate::error::SinkError;
use crate::reading::Reading;

/// # Cache Key
///
/// Opaque per-device key of the recent-readings cache, always of the form
/// `"<prefix>:<device_id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_device(prefix: &str, device_id: i64) -> Self {
        Self(format!("{}:{}", prefix, device_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// # Cache Sink
///
/// A per-key list store with Redis list semantics. Indices follow Redis:
/// `0` is the head, negative values count from the tail.
///
/// Implementations are shared by every worker, so they must be cheap to
/// clone and safe for concurrent use.
pub trait CacheSink: Clone + Send + Sync + 'static {
    /// Pushes `entry` to the head of the list stored at `key`.
    fn push_front(&self, key: &CacheKey, entry: &str) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Keeps only the elements between `start` and `stop` (inclusive).
    fn trim(&self, key: &CacheKey, start: isize, stop: isize) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Returns the elements between `start` and `stop` (inclusive).
    fn range(&self, key: &CacheKey, start: isize, stop: isize) -> impl Future<Output = Result<Vec<String>, SinkError>> + Send;
}

/// # Durable Sink
///
/// Append-only bulk insert into the historical store. A batch either lands
/// entirely or the call fails; there is no partial success.
///
/// Each worker owns its own instance, hence `&mut self`.
pub trait DurableSink: Send + Sync + 'static {
    fn insert_many(&mut self, readings: &[Reading]) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Reads up to `max_entries` recent readings for `device_id`, newest first.
///
/// This is the lookup the read-side service performs; entries that no longer
/// decode as a [`Reading`] are skipped.
pub async fn recent_readings<C: CacheSink>(
    cache: &C,
    prefix: &str,
    device_id: i64,
    max_entries: usize,
) -> Result<Vec<Reading>, SinkError> {
    let key = CacheKey::for_device(prefix, device_id);
    let n = max_entries.max(1) as isize;
    let entries = cache.range(&key, -n, -1).await?;
    Ok(entries
        .iter()
        .filter_map(|entry| match serde_json::from_str::<Reading>(entry) {
            Ok(reading) => Some(reading),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "skipping undecodable cache entry");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        assert_eq!(CacheKey::for_device("Sensor", 7).as_str(), "Sensor:7");
        assert_eq!(CacheKey::for_device("dev", -1).to_string(), "dev:-1");
    }
}
