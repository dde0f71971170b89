//! # lib_ingest
//!
//! Telemetry ingestion pipeline. Sensor readings published over MQTT are
//! queued, decoded by a pool of workers, kept as a short per-device history
//! in Redis and stored in batches in PostgreSQL.
//!
//! ```text
//! broker -> MqttConnector -> IntakeQueue -> WorkerPool -> CacheSink (recent N)
//!                                                      -> DurableSink (batched)
//! ```

pub mod configs;
pub mod connections;
pub mod core;
pub mod error;
pub mod reading;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "loggers")]
pub mod loggers;

pub use configs::{IngestArgs, IngestConfig};
pub use error::{IngestError, SinkError, SinkKind};
pub use reading::{RawMessage, Reading};
