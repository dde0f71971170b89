//! # Worker Pool
//!
//! Starts a fixed number of workers on the shared intake queue and owns their
//! lifecycle. Each worker gets its own durable writer and a clone of the
//! shared cache handle.
//!
//! ## Shutdown
//! - [`WorkerPool::drain`] closes the queue so workers finish what is queued,
//!   flush and exit. Workers still running when the grace period ends are
//!   cancelled.
//! - [`WorkerPool::cancel`] stops the workers right away; each one still
//!   flushes its buffer before exiting.
//!
//! Messages still queued once every worker has exited are counted as
//! `abandoned` in the [`PoolReport`].
//!
//! A worker that hits a fatal sink error cancels the rest of the pool and
//! trips [`WorkerPool::failed`], which the server watches to stop the pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connections::sink::{CacheSink, DurableSink};
use crate::core::intake_queue::IntakeQueue;
use crate::core::worker::{StatsSnapshot, Worker, WorkerReport, WorkerSettings, WorkerStats};
use crate::error::IngestError;
use crate::reading::{RawMessage, Reading};

pub struct WorkerPool {
    queue: Arc<IntakeQueue<RawMessage>>,
    cancel: CancellationToken,
    fatal: CancellationToken,
    handles: Vec<JoinHandle<WorkerReport>>,
    stats: Vec<Arc<WorkerStats>>,
}

impl WorkerPool {
    /// Spawns `num_workers` workers (at least one).
    ///
    /// # Arguments
    /// * `queue` - The intake queue shared with the connector.
    /// * `cache` - Shared cache handle, cloned into every worker.
    /// * `stores` - Builds the durable writer of worker `i`.
    pub fn start<C, D, F>(
        num_workers: usize,
        queue: Arc<IntakeQueue<RawMessage>>,
        cache: C,
        mut stores: F,
        settings: WorkerSettings,
    ) -> Self
    where
        C: CacheSink,
        D: DurableSink,
        F: FnMut(usize) -> D,
    {
        let num_workers = num_workers.max(1);
        let settings = Arc::new(settings);
        let cancel = CancellationToken::new();
        let fatal = CancellationToken::new();
        let mut handles = Vec::with_capacity(num_workers);
        let mut stats = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let worker = Worker::new(
                id,
                Arc::clone(&queue),
                cache.clone(),
                stores(id),
                Arc::clone(&settings),
                cancel.child_token(),
            );
            stats.push(worker.stats());

            let cancel = cancel.clone();
            let fatal = fatal.clone();
            handles.push(tokio::spawn(async move {
                let report = worker.run().await;
                if report.error.is_some() {
                    fatal.cancel();
                    cancel.cancel();
                }
                report
            }));
        }

        info!(workers = num_workers, batch_size = settings.batch_size, "worker pool started");
        Self {
            queue,
            cancel,
            fatal,
            handles,
            stats,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn queue(&self) -> &Arc<IntakeQueue<RawMessage>> {
        &self.queue
    }

    /// Live totals across all workers.
    pub fn stats(&self) -> StatsSnapshot {
        let mut totals = StatsSnapshot::default();
        for stats in &self.stats {
            totals += stats.snapshot();
        }
        totals
    }

    /// Resolves once a worker has stopped on a fatal sink error.
    pub async fn failed(&self) {
        self.fatal.cancelled().await
    }

    pub fn is_failed(&self) -> bool {
        self.fatal.is_cancelled()
    }

    /// Waits until every message put so far has been acknowledged.
    pub async fn join(&self) {
        self.queue.join().await
    }

    /// Graceful stop: closes the queue and lets the workers drain it, then
    /// cancels whatever is still running after `grace`.
    pub async fn drain(self, grace: Duration) -> PoolReport {
        info!(queued = self.queue.len(), grace_ms = grace.as_millis() as u64, "draining worker pool");
        self.queue.close();
        let deadline = Instant::now() + grace;
        self.collect(Some(deadline)).await
    }

    /// Immediate stop.
    pub async fn cancel(self) -> PoolReport {
        info!(queued = self.queue.len(), "cancelling worker pool");
        self.cancel.cancel();
        self.queue.close();
        self.collect(None).await
    }

    async fn collect(self, deadline: Option<Instant>) -> PoolReport {
        let mut workers = Vec::with_capacity(self.handles.len());
        let mut panicked = 0;

        for mut handle in self.handles {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        if !self.cancel.is_cancelled() {
                            warn!("shutdown grace period elapsed, cancelling workers");
                            self.cancel.cancel();
                        }
                        handle.await
                    }
                },
                None => handle.await,
            };
            match joined {
                Ok(report) => workers.push(report),
                Err(e) => {
                    panicked += 1;
                    error!(error = %e, "worker task failed");
                }
            }
        }

        let abandoned = self.queue.len();
        if abandoned > 0 {
            warn!(abandoned, "workers stopped with messages still queued");
        }

        let report = PoolReport::new(workers, panicked, abandoned);
        let totals = report.totals;
        info!(
            readings = totals.readings,
            persisted = totals.persisted,
            unflushed = report.unflushed_count(),
            abandoned,
            malformed = totals.malformed,
            batches = totals.batches,
            "worker pool stopped"
        );
        report
    }
}

/// Outcome of a stopped pool.
#[derive(Debug)]
pub struct PoolReport {
    pub workers: Vec<WorkerReport>,
    pub totals: StatsSnapshot,
    /// Workers whose task panicked; they have no report.
    pub panicked: usize,
    /// Messages left in the intake queue, never taken by a worker.
    pub abandoned: usize,
}

impl PoolReport {
    fn new(workers: Vec<WorkerReport>, panicked: usize, abandoned: usize) -> Self {
        let mut totals = StatsSnapshot::default();
        for worker in &workers {
            totals += worker.stats;
        }
        Self {
            workers,
            totals,
            panicked,
            abandoned,
        }
    }

    /// True when every queued message was processed, every worker exited
    /// without error and everything was flushed.
    pub fn is_clean(&self) -> bool {
        self.panicked == 0
            && self.abandoned == 0
            && self.workers.iter().all(|w| w.error.is_none() && w.unflushed.is_empty())
    }

    pub fn errors(&self) -> impl Iterator<Item = &IngestError> {
        self.workers.iter().filter_map(|w| w.error.as_ref())
    }

    pub fn unflushed(&self) -> impl Iterator<Item = &Reading> {
        self.workers.iter().flat_map(|w| w.unflushed.iter())
    }

    pub fn unflushed_count(&self) -> usize {
        self.workers.iter().map(|w| w.unflushed.len()).sum()
    }
}
