//! Reading codec
//!
//! A published payload is a flat JSON object:
//!
//! ```json
//! {"time":"2024-01-27T12:34:56.123456-05:00","client_id":"raspberrypi-z01",
//!  "garage_dr":"closed"}
//! ```
//!
//! `time` and `client_id` are common to every kind; the remaining fields are
//! the wire names of [`ReadingValue`].

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sensor::{Reading, ReadingValue, SensorKind};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to parse payload: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("payload does not describe a {0} reading")]
    KindMismatch(SensorKind),
}

#[derive(Serialize)]
struct Envelope<'a> {
    time: DateTime<Local>,
    client_id: &'a str,
    #[serde(flatten)]
    value: &'a ReadingValue,
}

/// A payload read back from the wire
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecodedReading {
    pub time: DateTime<Local>,
    pub client_id: String,
    #[serde(flatten)]
    pub value: ReadingValue,
}

pub fn encode(reading: &Reading, client_id: &str) -> Result<Vec<u8>, CodecError> {
    let envelope = Envelope {
        time: reading.time(),
        client_id,
        value: reading.value(),
    };
    serde_json::to_vec(&envelope).map_err(CodecError::Serialize)
}

pub fn decode(kind: SensorKind, payload: &[u8]) -> Result<DecodedReading, CodecError> {
    let decoded: DecodedReading = serde_json::from_slice(payload).map_err(CodecError::Parse)?;
    if !decoded.value.matches_kind(kind) {
        return Err(CodecError::KindMismatch(kind));
    }
    Ok(decoded)
}
