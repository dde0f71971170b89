//! # Ingestion Worker
//!
//! A worker pulls raw messages from the shared intake queue one at a time and
//! moves each reading into both sinks.
//!
//! ## Per-message Workflow:
//! 1.  **Get** one `RawMessage` from the queue.
//! 2.  **Decode** it. Malformed payloads are logged, counted and skipped.
//! 3.  **Cache**: push the serialized reading to the head of the device's list,
//!     then trim the list to the newest N entries. The two commands are not
//!     atomic; concurrent writers for the same device may interleave.
//! 4.  **Batch**: append the reading to the worker's own buffer.
//! 5.  **Flush** the buffer as one bulk insert once it reaches the batch size.
//! 6.  **Ack** the message on the queue.
//!
//! A reading is cached immediately but only durable once its batch is flushed.
//! Partial batches are flushed when the optional flush interval elapses and
//! when the worker stops. Sink calls are retried with bounded backoff; when the
//! attempts run out the worker stops and reports the error, keeping the
//! readings it could not store in its final report.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::configs::IngestConfig;
use crate::connections::sink::{CacheKey, CacheSink, DurableSink};
use crate::core::intake_queue::IntakeQueue;
use crate::core::retry::{Backoff, RetryPolicy};
use crate::error::{IngestError, SinkError, SinkKind};
use crate::reading::{RawMessage, Reading};

/// Settings shared by every worker of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    /// Flush a non-empty buffer after this long without a flush.
    pub flush_interval: Option<Duration>,
    pub retry: RetryPolicy,
    pub cache_prefix: String,
    /// Readings kept per device in the cache (N).
    pub cache_entries: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.pipeline.batch_size,
            flush_interval: config.pipeline.flush_interval,
            retry: config.pipeline.retry,
            cache_prefix: config.cache.key_prefix.clone(),
            cache_entries: config.cache.max_entries,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: None,
            retry: RetryPolicy::default(),
            cache_prefix: "Sensor".to_string(),
            cache_entries: 10,
        }
    }
}

/// # Worker Statistics
///
/// Live counters of one worker, readable from other tasks at any time.
/// Related counters change under one lock, so
/// `readings == persisted + buffered` holds in every snapshot.
#[derive(Debug, Default)]
pub struct WorkerStats {
    inner: Mutex<StatsSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages taken from the queue.
    pub messages: u64,
    /// Messages that decoded into a reading.
    pub readings: u64,
    pub malformed: u64,
    pub cached: u64,
    /// Readings written to the durable store.
    pub persisted: u64,
    /// Readings waiting in the batch buffer.
    pub buffered: u64,
    /// Successful bulk inserts.
    pub batches: u64,
    /// Sink calls that failed and were retried.
    pub retries: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        *self.lock()
    }

    fn update(&self, f: impl FnOnce(&mut StatsSnapshot)) {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, StatsSnapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::ops::AddAssign for StatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.messages += other.messages;
        self.readings += other.readings;
        self.malformed += other.malformed;
        self.cached += other.cached;
        self.persisted += other.persisted;
        self.buffered += other.buffered;
        self.batches += other.batches;
        self.retries += other.retries;
    }
}

/// Final state of a worker after it stopped.
#[derive(Debug)]
pub struct WorkerReport {
    pub id: usize,
    pub stats: StatsSnapshot,
    /// Readings that could not be written to the durable store.
    pub unflushed: Vec<Reading>,
    /// The fatal error that stopped the worker, if any.
    pub error: Option<IngestError>,
}

pub struct Worker<C, D> {
    id: usize,
    queue: Arc<IntakeQueue<RawMessage>>,
    cache: C,
    store: D,
    settings: Arc<WorkerSettings>,
    cancel: CancellationToken,
    batch: Vec<Reading>,
    last_flush: Instant,
    stats: Arc<WorkerStats>,
}

impl<C: CacheSink, D: DurableSink> Worker<C, D> {
    pub fn new(
        id: usize,
        queue: Arc<IntakeQueue<RawMessage>>,
        cache: C,
        store: D,
        settings: Arc<WorkerSettings>,
        cancel: CancellationToken,
    ) -> Self {
        let batch = Vec::with_capacity(settings.batch_size);
        Self {
            id,
            queue,
            cache,
            store,
            settings,
            cancel,
            batch,
            last_flush: Instant::now(),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Readings decoded by this worker that are not durable yet.
    pub fn buffered(&self) -> &[Reading] {
        &self.batch
    }

    /// Main loop. Returns once the queue is closed and drained, the
    /// cancellation token fires, or a sink fails for good. The buffer is
    /// flushed on the way out.
    pub async fn run(mut self) -> WorkerReport {
        info!(worker = self.id, batch_size = self.settings.batch_size, "worker started");
        let mut ticker = self.settings.flush_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let failure = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(worker = self.id, "cancellation requested");
                    break None;
                }
                message = self.queue.get() => {
                    let Some(message) = message else {
                        debug!(worker = self.id, "intake queue closed and drained");
                        break None;
                    };
                    let result = self.process(message).await;
                    self.queue.ack();
                    if let Err(e) = result {
                        break Some(e);
                    }
                }
                _ = next_tick(&mut ticker) => {
                    if let Err(e) = self.flush_if_stale().await {
                        break Some(e);
                    }
                }
            }
        };

        let error = match failure {
            None => self.flush().await.err(),
            Some(e @ IngestError::SinkUnavailable { sink: SinkKind::Cache, .. }) => {
                // The durable store may still be fine; keep what we have.
                if let Err(flush_err) = self.flush().await {
                    error!(worker = self.id, error = %flush_err, "final flush failed");
                }
                Some(e)
            }
            Some(e) => Some(e),
        };

        let stats = self.stats.snapshot();
        match &error {
            None => info!(
                worker = self.id,
                readings = stats.readings,
                persisted = stats.persisted,
                malformed = stats.malformed,
                "worker stopped"
            ),
            Some(e) => error!(
                worker = self.id,
                error = %e,
                unflushed = self.batch.len(),
                "worker stopped on a fatal sink error"
            ),
        }

        WorkerReport {
            id: self.id,
            stats,
            unflushed: std::mem::take(&mut self.batch),
            error,
        }
    }

    /// Steps 2 to 5 for one message: decode, cache, batch and flush when the
    /// batch is full. The caller acks the message afterwards.
    ///
    /// Malformed messages are not an error here; only an exhausted sink is.
    pub async fn process(&mut self, message: RawMessage) -> Result<(), IngestError> {
        self.stats.update(|s| s.messages += 1);

        let reading = match Reading::decode(&message) {
            Ok(reading) => reading,
            Err(e) => {
                self.stats.update(|s| s.malformed += 1);
                warn!(worker = self.id, error = %e, "skipping malformed message");
                return Ok(());
            }
        };
        debug!(
            worker = self.id,
            device_id = reading.device_id,
            temperature = reading.temperature,
            "reading received"
        );

        let cached = self.cache_reading(&reading).await;

        // Buffered even when the cache write failed, so the reading is still
        // offered to the durable store.
        self.batch.push(reading);
        self.stats.update(|s| {
            s.readings += 1;
            s.buffered += 1;
        });

        cached?;
        self.stats.update(|s| s.cached += 1);

        if self.batch.len() >= self.settings.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes the buffer to the durable store as one batch and clears it.
    /// On failure the buffer is kept intact.
    pub async fn flush(&mut self) -> Result<(), IngestError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut backoff = Backoff::new(self.settings.retry);
        loop {
            match self.store.insert_many(&self.batch).await {
                Ok(()) => break,
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        self.stats.update(|s| s.retries += 1);
                        warn!(
                            worker = self.id,
                            error = %e,
                            attempt = backoff.failures(),
                            retry_in_ms = delay.as_millis() as u64,
                            "durable insert failed, retrying"
                        );
                        self.pause(delay).await;
                    }
                    None => {
                        return Err(IngestError::SinkUnavailable {
                            sink: SinkKind::Durable,
                            attempts: backoff.failures(),
                            source: e,
                        })
                    }
                },
            }
        }

        let count = self.batch.len() as u64;
        self.batch.clear();
        self.last_flush = Instant::now();
        self.stats.update(|s| {
            s.persisted += count;
            s.buffered -= count;
            s.batches += 1;
        });
        debug!(worker = self.id, count, "batch flushed");
        Ok(())
    }

    async fn flush_if_stale(&mut self) -> Result<(), IngestError> {
        let Some(interval) = self.settings.flush_interval else {
            return Ok(());
        };
        if !self.batch.is_empty() && self.last_flush.elapsed() >= interval {
            debug!(worker = self.id, count = self.batch.len(), "flush interval elapsed");
            self.flush().await?;
        }
        Ok(())
    }

    /// Push then trim, each retried on its own so a retried trim never
    /// repeats the push.
    async fn cache_reading(&self, reading: &Reading) -> Result<(), IngestError> {
        let key = CacheKey::for_device(&self.settings.cache_prefix, reading.device_id);
        let entry = reading.to_json().map_err(|e| IngestError::SinkUnavailable {
            sink: SinkKind::Cache,
            attempts: 0,
            source: e.into(),
        })?;
        let last = self.settings.cache_entries.max(1) as isize - 1;

        let mut backoff = Backoff::new(self.settings.retry);
        while let Err(e) = self.cache.push_front(&key, &entry).await {
            self.cache_retry(&mut backoff, &key, e).await?;
        }
        let mut backoff = Backoff::new(self.settings.retry);
        while let Err(e) = self.cache.trim(&key, 0, last).await {
            self.cache_retry(&mut backoff, &key, e).await?;
        }
        Ok(())
    }

    async fn cache_retry(
        &self,
        backoff: &mut Backoff,
        key: &CacheKey,
        error: SinkError,
    ) -> Result<(), IngestError> {
        match backoff.next_delay() {
            Some(delay) => {
                self.stats.update(|s| s.retries += 1);
                warn!(
                    worker = self.id,
                    key = %key,
                    error = %error,
                    attempt = backoff.failures(),
                    "cache write failed, retrying"
                );
                self.pause(delay).await;
                Ok(())
            }
            None => Err(IngestError::SinkUnavailable {
                sink: SinkKind::Cache,
                attempts: backoff.failures(),
                source: error,
            }),
        }
    }

    /// Backoff sleep, cut short by cancellation so shutdown isn't held up.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::{MemoryCache, MemoryStore};

    fn message(device_id: i64, temperature: i64) -> RawMessage {
        RawMessage::new(
            "sensors/temperature",
            format!(
                r#"{{"device_id":{},"temperature":{},"timestamp":"2024-01-01T00:00:{:02}+00:00"}}"#,
                device_id,
                temperature,
                temperature % 60
            ),
        )
    }

    fn worker(settings: WorkerSettings) -> (Worker<MemoryCache, MemoryStore>, MemoryCache, MemoryStore) {
        let cache = MemoryCache::new();
        let store = MemoryStore::new();
        let worker = Worker::new(
            0,
            Arc::new(IntakeQueue::new(16)),
            cache.clone(),
            store.clone(),
            Arc::new(settings),
            CancellationToken::new(),
        );
        (worker, cache, store)
    }

    #[tokio::test]
    async fn test_batching_law() {
        let settings = WorkerSettings { batch_size: 5, ..Default::default() };
        let (mut worker, _cache, store) = worker(settings);

        for t in 0..12 {
            worker.process(message(1, t)).await.unwrap();
        }

        let batches = store.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 5));
        assert_eq!(worker.buffered().len(), 2);

        let stats = worker.stats().snapshot();
        assert_eq!(stats.readings, stats.persisted + stats.buffered);
        assert_eq!((stats.persisted, stats.buffered, stats.batches), (10, 2, 2));
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let (mut worker, cache, store) = worker(WorkerSettings::default());
        worker.process(RawMessage::new("t", "{oops")).await.unwrap();
        worker.process(message(2, 20)).await.unwrap();

        let stats = worker.stats().snapshot();
        assert_eq!((stats.messages, stats.malformed, stats.readings), (2, 1, 1));
        assert_eq!(cache.keys(), vec![CacheKey::for_device("Sensor", 2)]);
        assert!(store.batches().is_empty());
    }

    #[tokio::test]
    async fn test_cache_is_capped_newest_first() {
        let (mut worker, cache, _store) = worker(WorkerSettings::default());
        for t in 0..25 {
            worker.process(message(9, t)).await.unwrap();
        }
        let list = cache.list(&CacheKey::for_device("Sensor", 9));
        assert_eq!(list.len(), 10);
        let temps: Vec<i64> = list
            .iter()
            .map(|e| serde_json::from_str::<Reading>(e).unwrap().temperature)
            .collect();
        assert_eq!(temps, (15..25).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let settings = WorkerSettings {
            batch_size: 2,
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            ..Default::default()
        };
        let (mut worker, _cache, store) = worker(settings);
        store.fail_next(2);

        worker.process(message(1, 1)).await.unwrap();
        worker.process(message(1, 2)).await.unwrap();

        assert_eq!(store.attempts(), 3);
        assert_eq!(store.batches().len(), 1);
        assert_eq!(worker.stats().snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_store_keeps_the_batch() {
        let settings = WorkerSettings {
            batch_size: 2,
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
            ..Default::default()
        };
        let (mut worker, _cache, store) = worker(settings);
        store.fail_next(10);

        worker.process(message(1, 1)).await.unwrap();
        let err = worker.process(message(1, 2)).await.unwrap_err();
        match err {
            IngestError::SinkUnavailable { sink, attempts, .. } => {
                assert_eq!(sink, SinkKind::Durable);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(worker.buffered().len(), 2);
        let stats = worker.stats().snapshot();
        assert_eq!(stats.readings, stats.persisted + stats.buffered);
    }

    #[tokio::test]
    async fn test_exhausted_cache_still_buffers_reading() {
        let settings = WorkerSettings { retry: RetryPolicy::no_retry(), ..Default::default() };
        let (mut worker, cache, _store) = worker(settings);
        cache.fail_next(1);

        let err = worker.process(message(4, 30)).await.unwrap_err();
        assert!(matches!(err, IngestError::SinkUnavailable { sink: SinkKind::Cache, .. }));
        assert_eq!(worker.buffered().len(), 1);
        assert_eq!(worker.stats().snapshot().cached, 0);
    }
}
