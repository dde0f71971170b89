//! # Bounded Intake Queue
//!
//! A fixed-capacity FIFO that sits between the broker connector (the single
//! producer) and the worker pool (many consumers).
//!
//! ## Semantics:
//!
//! - **`put`** waits for a free slot. Nothing is ever dropped; a full queue
//!   simply stops the producer, which is how backpressure reaches the broker.
//! - **`get`** waits for an item.
//! - **`ack`** marks one previously received item as processed, and **`join`**
//!   waits until every item ever put has been acked.
//! - **`close`** is the shutdown signal: producers are refused, consumers
//!   drain what is left and then receive `None`.
//!
//! Two semaphores carry the accounting: `slots` counts free capacity and
//! `ready` counts queued items, so the deque never holds more than `capacity`
//! entries. The unacked count is published on a `watch` channel for `join`.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{watch, Semaphore};

/// Returned by [`IntakeQueue::put`] once the queue is closed. Carries the item
/// back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed<T>(pub T);

pub struct IntakeQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    slots: Semaphore,
    ready: Semaphore,
    pending: watch::Sender<usize>,
}

impl<T> IntakeQueue<T> {
    /// Creates a queue holding at most `capacity` items (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (pending, _) = watch::channel(0);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            pending,
        }
    }

    /// Enqueues `item`, waiting while the queue is full.
    pub async fn put(&self, item: T) -> Result<(), Closed<T>> {
        let permit = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(Closed(item)),
        };
        permit.forget();

        // Counted before the item becomes visible so `join` can never observe
        // zero while it is still queued.
        self.pending.send_modify(|n| *n += 1);
        self.lock_items().push_back(item);
        self.ready.add_permits(1);
        Ok(())
    }

    /// Dequeues the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn get(&self) -> Option<T> {
        match self.ready.acquire().await {
            Ok(permit) => {
                permit.forget();
                let item = self.lock_items().pop_front();
                self.slots.add_permits(1);
                item
            }
            // After close the permits are meaningless; drain directly.
            Err(_) => self.lock_items().pop_front(),
        }
    }

    /// Marks one dequeued item as processed.
    pub fn ack(&self) {
        let mut underflow = false;
        self.pending.send_modify(|n| {
            if *n == 0 {
                underflow = true;
            } else {
                *n -= 1;
            }
        });
        if underflow {
            tracing::warn!("intake queue ack without a matching item; ignored");
        }
    }

    /// Waits until every item that was put has been acked.
    pub async fn join(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Refuses further `put`s and lets consumers drain the remaining items.
    pub fn close(&self) {
        self.slots.close();
        self.ready.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items put but not yet acked (queued plus in flight at the workers).
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    fn lock_items(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // The lock is never held across an await or a user callback, so a
        // poisoned mutex still guards a consistent deque.
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
