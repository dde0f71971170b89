//! # Data Ingestors Module
//!
//! The "front door" of the pipeline: clients that receive raw messages from
//! an external source and hand them to the intake queue.
//!
//! ## Contained Modules:
//! - **`mqtt_broker`**: The MQTT subscriber that feeds sensor publishes into
//!   the queue and tracks the broker connection state.

/// The MQTT client for the sensor topics.
pub mod mqtt_broker;

// --- Public API Re-exports ---
pub use mqtt_broker::{ConnectionState, MqttConnector};
