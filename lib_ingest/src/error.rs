//! # Pipeline Errors
//!
//! The error taxonomy of the ingestion pipeline. Each variant carries its own
//! handling policy:
//!
//! - **`MalformedMessage`**: logged, counted and skipped by the worker.
//! - **`SinkUnavailable`**: retried with bounded backoff; exhaustion is fatal
//!   for the worker that hit it.
//! - **`ConnectionLost`**: reconnection is left to the MQTT transport; the
//!   connector only gives up after the configured number of attempts.

use thiserror::Error;

use crate::configs::ConfigError;

/// Which of the two sinks an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Cache,
    Durable,
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkKind::Cache => write!(f, "cache"),
            SinkKind::Durable => write!(f, "durable store"),
        }
    }
}

/// Errors raised by sink adapters (Redis, Postgres, in-memory).
#[derive(Debug, Error)]
pub enum SinkError {
    #[cfg(feature = "connections")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "connections")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "connections")]
    #[error("postgres pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[cfg(feature = "connections")]
    #[error("postgres pool setup error: {0}")]
    PoolSetup(#[from] deadpool_postgres::CreatePoolError),

    #[error("serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Top-level pipeline error.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed message on topic '{topic}': {reason}")]
    MalformedMessage { topic: String, reason: String },

    #[error("{sink} unavailable after {attempts} attempt(s): {source}")]
    SinkUnavailable {
        sink: SinkKind,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("intake queue is closed")]
    QueueClosed,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
