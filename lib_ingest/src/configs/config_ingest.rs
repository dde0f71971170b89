//! # Ingestion Service Configuration
//!
//! Every recognized option is declared once on [`IngestArgs`], readable from a
//! command-line flag or from the environment (a `.env` file is loaded by the
//! binary before parsing). [`IngestArgs::into_config`] validates the options
//! and groups them into the per-component structs of [`IngestConfig`], which
//! is built once at startup and passed by reference.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::core::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("at least one broker topic is required")]
    NoTopics,

    #[error("invalid table name '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidTable(String),

    #[error("retry base delay ({base_ms}ms) exceeds max delay ({max_ms}ms)")]
    RetryDelays { base_ms: u64, max_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// # Ingestion Arguments
///
/// Raw options as parsed by `clap` from flags and environment variables.
#[derive(Parser, Debug, Clone)]
#[clap(
    author,
    version,
    about = "Subscribes to device telemetry over MQTT and stores it in Redis and PostgreSQL."
)]
pub struct IngestArgs {
    // --- Broker ---
    #[clap(long, env = "BROKER_HOST", default_value = "localhost", help = "MQTT broker host.")]
    pub broker_host: String,

    #[clap(long, env = "BROKER_PORT", default_value_t = 1883, help = "MQTT broker port.")]
    pub broker_port: u16,

    #[clap(long, env = "BROKER_CLIENT_ID", default_value = "telemetry-ingest", help = "MQTT client identifier.")]
    pub broker_client_id: String,

    #[clap(long, env = "BROKER_KEEPALIVE_SECS", default_value_t = 60, help = "MQTT keep-alive interval in seconds.")]
    pub broker_keepalive_secs: u64,

    #[clap(
        long = "topic",
        env = "TOPIC",
        value_delimiter = ',',
        default_value = "sensors/temperature",
        help = "Comma-separated list of topics to subscribe to."
    )]
    pub topics: Vec<String>,

    #[clap(long, env = "BROKER_RECONNECT_DELAY_MS", default_value_t = 1000, help = "Pause between broker reconnect attempts.")]
    pub broker_reconnect_delay_ms: u64,

    #[clap(
        long,
        env = "BROKER_MAX_RECONNECT_ATTEMPTS",
        default_value_t = 0,
        help = "Consecutive failed reconnects before giving up (0 = never give up)."
    )]
    pub broker_max_reconnect_attempts: u32,

    // --- Pipeline ---
    #[clap(long, env = "NUM_WORKERS", default_value_t = 4, help = "Number of workers.")]
    pub num_workers: usize,

    #[clap(long, env = "BATCH_SIZE", default_value_t = 100, help = "Readings per durable bulk insert.")]
    pub batch_size: usize,

    #[clap(long, env = "QUEUE_CAPACITY", default_value_t = 100, help = "Capacity of the intake queue.")]
    pub queue_capacity: usize,

    #[clap(
        long,
        env = "FLUSH_INTERVAL_MS",
        default_value_t = 5000,
        help = "Flush a partial batch after this many milliseconds (0 = only flush full batches)."
    )]
    pub flush_interval_ms: u64,

    #[clap(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10, help = "Time allowed to drain the queue on shutdown.")]
    pub shutdown_grace_secs: u64,

    #[clap(long, env = "SINK_RETRY_ATTEMPTS", default_value_t = 5, help = "Attempts per sink write before failing.")]
    pub sink_retry_attempts: u32,

    #[clap(long, env = "SINK_RETRY_BASE_DELAY_MS", default_value_t = 100, help = "Initial backoff between sink retries.")]
    pub sink_retry_base_delay_ms: u64,

    #[clap(long, env = "SINK_RETRY_MAX_DELAY_MS", default_value_t = 5000, help = "Upper bound for sink retry backoff.")]
    pub sink_retry_max_delay_ms: u64,

    // --- Durable store ---
    #[clap(long, env = "PG_HOST", default_value = "localhost", help = "PostgreSQL host.")]
    pub pg_host: String,

    #[clap(long, env = "PG_PORT", default_value_t = 5432, help = "PostgreSQL port.")]
    pub pg_port: u16,

    #[clap(long, env = "PG_USER", default_value = "postgres", help = "PostgreSQL user.")]
    pub pg_user: String,

    #[clap(long, env = "PG_PASSWORD", hide_env_values = true, help = "PostgreSQL password.")]
    pub pg_password: Option<String>,

    #[clap(long, env = "PG_DB", default_value = "telemetry", help = "PostgreSQL database name.")]
    pub pg_db: String,

    #[clap(long, env = "PG_TABLE", default_value = "readings", help = "Table receiving the readings.")]
    pub pg_table: String,

    // --- Cache ---
    #[clap(long, env = "REDIS_HOST", default_value = "localhost", help = "Redis host.")]
    pub redis_host: String,

    #[clap(long, env = "REDIS_PORT", default_value_t = 6379, help = "Redis port.")]
    pub redis_port: u16,

    #[clap(long, env = "REDIS_DB", default_value_t = 0, help = "Redis logical database.")]
    pub redis_db: i64,

    #[clap(long, env = "REDIS_KEY_PREFIX", default_value = "Sensor", help = "Prefix of the per-device cache keys.")]
    pub redis_key_prefix: String,

    #[clap(long, env = "REDIS_LAST_READINGS_COUNT", default_value_t = 10, help = "Readings kept per device in the cache.")]
    pub redis_last_readings_count: usize,

    // --- Logging ---
    #[clap(long, env = "LOG_LEVEL", default_value = "info", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: String,

    #[clap(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, help = "Log output format.")]
    pub log_format: LogFormat,

    #[clap(long, env = "LOG_DIR", help = "Directory for daily rotated log files.")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub topics: Vec<String>,
    pub reconnect_delay: Duration,
    /// `None` means retry forever.
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub num_workers: usize,
    pub batch_size: usize,
    pub queue_capacity: usize,
    /// `None` disables time-based flushing.
    pub flush_interval: Option<Duration>,
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub key_prefix: String,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub dir: Option<PathBuf>,
}

/// # Ingest Configuration
///
/// The validated configuration of the whole service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub broker: BrokerConfig,
    pub pipeline: PipelineConfig,
    pub durable: DurableConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

impl IngestArgs {
    /// Validates the raw options and builds the typed configuration.
    pub fn into_config(self) -> Result<IngestConfig, ConfigError> {
        let non_zero = |value: usize, name: &'static str| {
            if value == 0 {
                Err(ConfigError::Zero(name))
            } else {
                Ok(value)
            }
        };

        non_zero(self.num_workers, "NUM_WORKERS")?;
        non_zero(self.batch_size, "BATCH_SIZE")?;
        non_zero(self.queue_capacity, "QUEUE_CAPACITY")?;
        non_zero(self.redis_last_readings_count, "REDIS_LAST_READINGS_COUNT")?;
        non_zero(self.sink_retry_attempts as usize, "SINK_RETRY_ATTEMPTS")?;

        let topics: Vec<String> = self
            .topics
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }

        if !is_sql_identifier(&self.pg_table) {
            return Err(ConfigError::InvalidTable(self.pg_table));
        }

        if self.sink_retry_base_delay_ms > self.sink_retry_max_delay_ms {
            return Err(ConfigError::RetryDelays {
                base_ms: self.sink_retry_base_delay_ms,
                max_ms: self.sink_retry_max_delay_ms,
            });
        }

        Ok(IngestConfig {
            broker: BrokerConfig {
                host: self.broker_host,
                port: self.broker_port,
                client_id: self.broker_client_id.trim().to_string(),
                keep_alive: Duration::from_secs(self.broker_keepalive_secs),
                topics,
                reconnect_delay: Duration::from_millis(self.broker_reconnect_delay_ms),
                max_reconnect_attempts: match self.broker_max_reconnect_attempts {
                    0 => None,
                    n => Some(n),
                },
            },
            pipeline: PipelineConfig {
                num_workers: self.num_workers,
                batch_size: self.batch_size,
                queue_capacity: self.queue_capacity,
                flush_interval: match self.flush_interval_ms {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                },
                shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
                retry: RetryPolicy::new(
                    self.sink_retry_attempts,
                    Duration::from_millis(self.sink_retry_base_delay_ms),
                    Duration::from_millis(self.sink_retry_max_delay_ms),
                ),
            },
            durable: DurableConfig {
                host: self.pg_host,
                port: self.pg_port,
                user: self.pg_user,
                password: self.pg_password,
                dbname: self.pg_db,
                table: self.pg_table,
            },
            cache: CacheConfig {
                host: self.redis_host,
                port: self.redis_port,
                db: self.redis_db,
                key_prefix: self.redis_key_prefix,
                max_entries: self.redis_last_readings_count,
            },
            log: LogConfig {
                level: self.log_level,
                format: self.log_format,
                dir: self.log_dir,
            },
        })
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
