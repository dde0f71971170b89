//! # Telemetry Ingestion Server
//!
//! Subscribes to sensor topics on an MQTT broker and stores every reading in
//! two places: the newest N readings per device in Redis, and the full
//! history in PostgreSQL, written in batches.
//!
//! ## Startup:
//! 1.  Load `.env`, parse options (flags or environment) and validate them.
//! 2.  Initialize `tracing`.
//! 3.  Connect to Redis, create the PostgreSQL pool and the readings table.
//! 4.  Start the worker pool on a bounded intake queue.
//! 5.  Start the broker connector feeding that queue.
//!
//! ## Shutdown:
//! Triggered by Ctrl-C/SIGTERM, by the connector giving up, or by a worker
//! failing on a sink. The connector is stopped first so nothing new is
//! queued. On a clean stop the pool drains the queue and flushes every batch
//! within `SHUTDOWN_GRACE_SECS`; after a sink failure it is cancelled and
//! the unflushed readings are reported.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use lib_ingest::configs::IngestArgs;
use lib_ingest::connections::{PostgresStore, RedisCache};
use lib_ingest::core::{IntakeQueue, WorkerPool, WorkerSettings};
use lib_ingest::ingestors::MqttConnector;
use lib_ingest::loggers::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = IngestArgs::parse().into_config()?;
    let _log_guard = init_tracing(&config.log)?;
    info!(
        workers = config.pipeline.num_workers,
        batch_size = config.pipeline.batch_size,
        queue_capacity = config.pipeline.queue_capacity,
        "starting ingestion server"
    );

    let cache = RedisCache::connect(&config.cache).await.context("connecting to redis")?;
    cache.ping().await.context("pinging redis")?;

    // One connection per worker plus one for schema setup and reads.
    let store = PostgresStore::new(&config.durable, config.pipeline.num_workers + 1)
        .context("creating the postgres pool")?;
    store.ensure_schema().await.context("preparing the readings table")?;

    let queue = Arc::new(IntakeQueue::new(config.pipeline.queue_capacity));
    let pool = WorkerPool::start(
        config.pipeline.num_workers,
        Arc::clone(&queue),
        cache,
        |_| store.writer(),
        WorkerSettings::from_config(&config),
    );

    let connector_cancel = CancellationToken::new();
    let mut connector = MqttConnector::new(&config.broker);
    let mut connector_task = tokio::spawn({
        let queue = Arc::clone(&queue);
        let cancel = connector_cancel.clone();
        async move { connector.run(queue, cancel).await }
    });

    let mut connector_running = true;
    let outcome: anyhow::Result<()> = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
        _ = pool.failed() => Err(anyhow!("a worker stopped on a fatal sink error")),
        joined = &mut connector_task => {
            connector_running = false;
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow!("broker connector task failed: {}", e)),
            }
        }
    };

    connector_cancel.cancel();
    if connector_running {
        match connector_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "broker connector ended with an error"),
            Err(e) => error!(error = %e, "broker connector task failed"),
        }
    }

    let report = if pool.is_failed() {
        pool.cancel().await
    } else {
        pool.drain(config.pipeline.shutdown_grace).await
    };

    for e in report.errors() {
        error!(error = %e, "worker error");
    }
    if !report.is_clean() {
        warn!(
            unflushed = report.unflushed_count(),
            abandoned = report.abandoned,
            panicked = report.panicked,
            "shutdown left readings unstored"
        );
    }
    info!(
        messages = report.totals.messages,
        persisted = report.totals.persisted,
        malformed = report.totals.malformed,
        "ingestion server stopped"
    );
    outcome
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
