use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lib_ingest::connections::{recent_readings, CacheKey, MemoryCache, MemoryStore};
use lib_ingest::core::{IntakeQueue, RetryPolicy, WorkerPool, WorkerSettings};
use lib_ingest::{IngestError, RawMessage, Reading, SinkKind};

fn payload(device_id: i64, temperature: i64) -> String {
    format!(
        r#"{{"device_id":{},"temperature":{},"timestamp":"2024-01-01T00:00:00+00:00"}}"#,
        device_id, temperature
    )
}

fn message(device_id: i64, temperature: i64) -> RawMessage {
    RawMessage::new("sensors/temperature", payload(device_id, temperature))
}

fn settings(batch_size: usize) -> WorkerSettings {
    WorkerSettings {
        batch_size,
        flush_interval: None,
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        cache_prefix: "Sensor".to_string(),
        cache_entries: 10,
    }
}

/// A pool whose workers each write to their own store; the store handles are
/// returned in worker order.
fn start_pool(
    workers: usize,
    capacity: usize,
    settings: WorkerSettings,
) -> (WorkerPool, Arc<IntakeQueue<RawMessage>>, MemoryCache, Vec<MemoryStore>) {
    let queue = Arc::new(IntakeQueue::new(capacity));
    let cache = MemoryCache::new();
    let stores: Vec<MemoryStore> = (0..workers).map(|_| MemoryStore::new()).collect();
    let handles = stores.clone();
    let pool = WorkerPool::start(workers, Arc::clone(&queue), cache.clone(), |i| handles[i].clone(), settings);
    (pool, queue, cache, stores)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_device_7_reading_is_cached_then_flushed() {
    let (pool, queue, cache, stores) = start_pool(1, 4, settings(2));

    queue.put(message(7, 33)).await.unwrap();
    pool.join().await;

    let key = CacheKey::for_device("Sensor", 7);
    let head: Reading = serde_json::from_str(&cache.list(&key)[0]).unwrap();
    assert_eq!(head.device_id, 7);
    assert_eq!(head.temperature, 33);
    assert!(stores[0].batches().is_empty(), "not durable before the batch fills");

    queue.put(message(7, 34)).await.unwrap();
    pool.join().await;

    let batches = stores[0].batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0], head);

    let report = pool.drain(Duration::from_secs(5)).await;
    assert!(report.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_waits_for_concurrent_producers() {
    let (pool, queue, _cache, _stores) = start_pool(3, 4, settings(7));

    let mut producers = Vec::new();
    for p in 0..4 {
        let queue = Arc::clone(&queue);
        producers.push(tokio::spawn(async move {
            for t in 0..50 {
                queue.put(message(p, t)).await.unwrap();
                assert!(queue.len() <= queue.capacity());
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    pool.join().await;
    assert_eq!(queue.pending(), 0);
    let stats = pool.stats();
    assert_eq!(stats.messages, 200);
    assert_eq!(stats.readings, stats.persisted + stats.buffered);

    let report = pool.drain(Duration::from_secs(5)).await;
    assert_eq!(report.totals.persisted, 200);
    assert_eq!(report.totals.buffered, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conservation_holds_while_running() {
    let (pool, queue, _cache, _stores) = start_pool(4, 8, settings(5));

    let producer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            for t in 0..300 {
                queue.put(message(t % 13, t)).await.unwrap();
            }
        })
    };

    while !producer.is_finished() {
        let stats = pool.stats();
        assert_eq!(stats.readings, stats.persisted + stats.buffered);
        tokio::task::yield_now().await;
    }
    producer.await.unwrap();
    pool.join().await;

    let stats = pool.stats();
    assert_eq!(stats.readings, 300);
    assert_eq!(stats.readings, stats.persisted + stats.buffered);
    pool.drain(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_keep_separate_batches() {
    let batch_size = 4;
    let (pool, queue, _cache, stores) = start_pool(3, 6, settings(batch_size));

    for t in 0..61 {
        queue.put(message(t, t)).await.unwrap();
    }
    pool.join().await;
    let report = pool.drain(Duration::from_secs(5)).await;
    assert!(report.is_clean());

    let mut seen = HashSet::new();
    for store in &stores {
        let batches = store.batches();
        // Only the shutdown flush may be short.
        if let Some((_last, full)) = batches.split_last() {
            assert!(full.iter().all(|b| b.len() == batch_size));
        }
        for reading in batches.iter().flatten() {
            assert!(seen.insert(reading.temperature), "reading stored twice");
        }
    }
    assert_eq!(seen.len(), 61);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_keeps_newest_ten_per_device() {
    let (pool, queue, cache, _stores) = start_pool(1, 4, settings(100));

    for t in 0..25 {
        queue.put(message(3, t)).await.unwrap();
    }
    pool.join().await;

    let list = cache.list(&CacheKey::for_device("Sensor", 3));
    assert_eq!(list.len(), 10);
    let newest: Reading = serde_json::from_str(&list[0]).unwrap();
    assert_eq!(newest.temperature, 24);

    let recent = recent_readings(&cache, "Sensor", 3, 10).await.unwrap();
    assert_eq!(recent.len(), 10);
    assert_eq!(recent[0].temperature, 24);

    let report = pool.drain(Duration::from_secs(5)).await;
    assert_eq!(report.totals.persisted, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_messages_are_skipped() {
    let (pool, queue, _cache, stores) = start_pool(2, 4, settings(100));

    queue.put(RawMessage::new("sensors/temperature", "not json")).await.unwrap();
    queue.put(RawMessage::new("sensors/temperature", r#"{"device_id":1}"#)).await.unwrap();
    queue.put(message(1, 20)).await.unwrap();
    pool.join().await;

    let report = pool.drain(Duration::from_secs(5)).await;
    assert!(report.is_clean());
    assert_eq!(report.totals.malformed, 2);
    assert_eq!(report.totals.readings, 1);
    let stored: usize = stores.iter().map(|s| s.readings().len()).sum();
    assert_eq!(stored, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_flushes_partial_batches() {
    let (pool, queue, _cache, stores) = start_pool(2, 16, settings(100));

    for t in 0..7 {
        queue.put(message(1, t)).await.unwrap();
    }
    let report = pool.drain(Duration::from_secs(5)).await;

    assert!(report.is_clean());
    assert_eq!(report.totals.messages, 7);
    let stored: usize = stores.iter().map(|s| s.readings().len()).sum();
    assert_eq!(stored, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_flushes_what_was_buffered() {
    let (pool, queue, _cache, stores) = start_pool(1, 16, settings(100));

    for t in 0..5 {
        queue.put(message(1, t)).await.unwrap();
    }
    pool.join().await;
    let report = pool.cancel().await;

    assert!(report.is_clean());
    assert_eq!(stores[0].batches().len(), 1);
    assert_eq!(stores[0].readings().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flush_interval_flushes_partial_batch() {
    let mut settings = settings(100);
    settings.flush_interval = Some(Duration::from_millis(20));
    let (pool, queue, _cache, stores) = start_pool(1, 4, settings);

    queue.put(message(5, 1)).await.unwrap();
    pool.join().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stores[0].batches().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "interval flush never happened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stores[0].readings().len(), 1);
    pool.drain(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_store_failure_recovers() {
    let (pool, queue, _cache, stores) = start_pool(1, 4, settings(2));
    stores[0].fail_next(2);

    queue.put(message(1, 1)).await.unwrap();
    queue.put(message(1, 2)).await.unwrap();
    pool.join().await;

    assert_eq!(stores[0].batches().len(), 1);
    assert!(!pool.is_failed());
    let report = pool.drain(Duration::from_secs(5)).await;
    assert!(report.is_clean());
    assert_eq!(report.totals.retries, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_store_fails_the_pool() {
    let (pool, queue, _cache, stores) = start_pool(1, 4, settings(2));
    stores[0].fail_next(u32::MAX);

    queue.put(message(1, 1)).await.unwrap();
    queue.put(message(1, 2)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), pool.failed()).await.unwrap();
    let report = pool.cancel().await;

    assert!(!report.is_clean());
    assert_eq!(report.unflushed_count(), 2);
    let errors: Vec<&IngestError> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        IngestError::SinkUnavailable { sink: SinkKind::Durable, attempts: 3, .. }
    ));
    assert_eq!(report.totals.readings, report.totals.persisted + report.totals.buffered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_timeout_reports_queued_messages() {
    let mut settings = settings(1);
    settings.retry = RetryPolicy::new(3, Duration::from_millis(200), Duration::from_millis(200));
    let (pool, queue, _cache, stores) = start_pool(1, 16, settings);
    stores[0].fail_next(2);

    for t in 0..10 {
        queue.put(message(1, t)).await.unwrap();
    }
    let report = pool.drain(Duration::from_millis(50)).await;

    assert!(report.abandoned > 0);
    assert_eq!(report.abandoned as u64 + report.totals.messages, 10);
    assert_eq!(queue.len(), report.abandoned);
    assert!(!report.is_clean());
}
