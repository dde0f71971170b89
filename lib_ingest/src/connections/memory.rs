//! # In-Memory Sinks
//!
//! Process-local implementations of [`CacheSink`] and [`DurableSink`] with
//! the same semantics as the Redis and PostgreSQL adapters. Clones share
//! state, so a test can keep a handle and inspect what the workers wrote.
//! Both support failure injection through `fail_next`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connections::sink::{CacheKey, CacheSink, DurableSink};
use crate::error::SinkError;
use crate::reading::Reading;

/// Resolves Redis-style inclusive `start..=stop` indices against a list of
/// length `len`. Returns `None` when the range is empty.
fn resolve_range(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consumes one injected failure, if any are left.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    lists: Arc<Mutex<HashMap<CacheKey, VecDeque<String>>>>,
    fail_next: Arc<AtomicU32>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` operations fail with [`SinkError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Snapshot of the list stored at `key`, head first.
    pub fn list(&self, key: &CacheKey) -> Vec<String> {
        lock(&self.lists)
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        lock(&self.lists).keys().cloned().collect()
    }

    fn check(&self) -> Result<(), SinkError> {
        if take_failure(&self.fail_next) {
            Err(SinkError::Unavailable("injected cache failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl CacheSink for MemoryCache {
    async fn push_front(&self, key: &CacheKey, entry: &str) -> Result<(), SinkError> {
        self.check()?;
        lock(&self.lists)
            .entry(key.clone())
            .or_default()
            .push_front(entry.to_string());
        Ok(())
    }

    async fn trim(&self, key: &CacheKey, start: isize, stop: isize) -> Result<(), SinkError> {
        self.check()?;
        let mut lists = lock(&self.lists);
        if let Some(list) = lists.get_mut(key) {
            match resolve_range(start, stop, list.len()) {
                Some((from, to)) => {
                    list.truncate(to + 1);
                    list.drain(..from);
                }
                None => list.clear(),
            }
            if list.is_empty() {
                lists.remove(key);
            }
        }
        Ok(())
    }

    async fn range(&self, key: &CacheKey, start: isize, stop: isize) -> Result<Vec<String>, SinkError> {
        self.check()?;
        let lists = lock(&self.lists);
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(start, stop, list.len()) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }
}

/// Records every successful batch in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    batches: Arc<Mutex<Vec<Vec<Reading>>>>,
    fail_next: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` inserts fail with [`SinkError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<Reading>> {
        lock(&self.batches).clone()
    }

    pub fn readings(&self) -> Vec<Reading> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }

    /// Number of `insert_many` calls, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl DurableSink for MemoryStore {
    async fn insert_many(&mut self, readings: &[Reading]) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_next) {
            return Err(SinkError::Unavailable("injected store failure".to_string()));
        }
        lock(&self.batches).push(readings.to_vec());
        Ok(())
    }
}
