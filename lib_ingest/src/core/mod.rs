//! # Core Engine Module
//!
//! The processing side of the ingestion pipeline: the bounded intake queue
//! that decouples the broker from storage, and the workers that drain it.
//!
//! ## Core Components:
//!
//! - **`intake_queue`**: A bounded FIFO with a pending counter. `put` blocks
//!   while the queue is full, which pushes back on the broker connector;
//!   `join` waits until every queued message has been acknowledged.
//!
//! - **`worker`**: Decodes each message, caches the reading under the
//!   device's key and batches it for bulk insertion into the durable store.
//!
//! - **`worker_pool`**: Spawns the workers and coordinates drain, cancel and
//!   fatal-error shutdown.
//!
//! - **`retry`**: The bounded exponential backoff around every sink call.

/// Bounded multi-producer/multi-consumer queue with acknowledgement.
pub mod intake_queue;
/// Bounded exponential backoff.
pub mod retry;
/// A single decode/cache/batch worker.
pub mod worker;
/// Lifecycle of the fixed-size worker set.
pub mod worker_pool;

// --- Public API Re-exports ---
pub use intake_queue::{Closed, IntakeQueue};
pub use retry::{Backoff, RetryPolicy};
pub use worker::{StatsSnapshot, Worker, WorkerReport, WorkerSettings, WorkerStats};
pub use worker_pool::{PoolReport, WorkerPool};
