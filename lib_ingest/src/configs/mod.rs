//! # Configuration Modules
//!
//! This module aggregates the configuration of the ingestion service: the
//! command-line/environment surface and the validated, typed configuration
//! that is handed to each component.

/// Command-line and environment options, and the typed `IngestConfig` built from them.
pub mod config_ingest;

pub use config_ingest::{
    BrokerConfig, CacheConfig, ConfigError, DurableConfig, IngestArgs, IngestConfig, LogConfig,
    LogFormat, PipelineConfig,
};
