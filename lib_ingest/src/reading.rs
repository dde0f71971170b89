//! # Reading
//!
//! The telemetry sample that flows through the pipeline, and the raw broker
//! message it is decoded from.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IngestError;

/// # Reading
///
/// One device's telemetry sample. Immutable once decoded.
///
/// On the wire a reading is a JSON object:
/// `{"device_id": 7, "temperature": 33, "timestamp": "2024-01-01T00:00:00+00:00"}`.
/// The legacy field name `sensor_id` is accepted in place of `device_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Identifier of the device that produced the sample.
    #[serde(alias = "sensor_id")]
    pub device_id: i64,
    /// Sampling time, with the UTC offset the device reported.
    #[serde(with = "offset_timestamp")]
    pub timestamp: DateTime<FixedOffset>,
    /// Temperature in whole degrees.
    pub temperature: i64,
}

impl Reading {
    pub fn new(device_id: i64, timestamp: DateTime<FixedOffset>, temperature: i64) -> Self {
        Self {
            device_id,
            timestamp,
            temperature,
        }
    }

    /// Decodes a broker payload into a `Reading`.
    ///
    /// Any failure (invalid UTF-8, invalid JSON, missing fields, bad timestamp)
    /// is reported as [`IngestError::MalformedMessage`].
    pub fn decode(message: &RawMessage) -> Result<Self, IngestError> {
        serde_json::from_slice(&message.payload).map_err(|e| IngestError::MalformedMessage {
            topic: message.topic.clone(),
            reason: e.to_string(),
        })
    }

    /// Serializes the reading into the JSON form stored in the cache.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// # Raw Message
///
/// An opaque payload plus the topic it arrived on, exactly as delivered by the
/// broker. Owned by the connector until it is put on the intake queue, then by
/// whichever worker dequeues it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Timestamps are written as RFC 3339. On input the compact `+HHMM` offset
/// form is accepted too, since some publishers format with `%z`.
mod offset_timestamp {
    use super::*;

    const COMPACT_OFFSET: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

    pub fn serialize<S: Serializer>(ts: &DateTime<FixedOffset>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<FixedOffset>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .or_else(|_| DateTime::parse_from_str(&raw, COMPACT_OFFSET))
            .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
    }
}
