//! Telemetry decoding
//!
//! Turns a raw `(topic, payload)` pair into an [`InboundEvent`]. Nothing here
//! touches the registry or the store; a failed decode is returned to the
//! caller as a [`DecodeError`] and never panics.

mod topic;
mod types;

use chrono::DateTime;
use serde_json::{Map, Value};
use thiserror::Error;

pub use topic::{DEFAULT_ANNOUNCE_TOPIC, DEFAULT_DATA_FILTER, TopicLayout};
pub use types::{InboundEvent, SensorReading};

/// Why an inbound message was dropped
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not valid JSON
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Payload is valid JSON but not an object
    #[error("payload is not a json object")]
    NotAnObject,

    /// Announcement carries no `id` field
    #[error("announcement has no 'id' field")]
    MissingId,

    /// `id` is neither a string nor an integer, or is empty
    #[error("announcement id is not usable: {0}")]
    InvalidId(String),

    /// Required telemetry field is absent
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// Telemetry field is present but not a usable number
    #[error("field '{field}' has unusable value {value}")]
    InvalidField { field: &'static str, value: String },

    /// Topic lacks the data prefix or suffix
    #[error("topic '{0}' does not match the data layout")]
    TopicMismatch(String),

    /// Topic has the anchors but nothing between them
    #[error("topic carries an empty node id")]
    EmptyNodeId,

    /// Node id spans more than one topic level
    #[error("node id '{0}' spans several topic levels")]
    InvalidNodeId(String),

    /// Topic is neither the announcement topic nor a data topic
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
}

/// Decode an inbound message into a typed event
///
/// # Errors
///
/// Returns a [`DecodeError`] if the topic is not recognised or the payload is
/// malformed; the caller is expected to log and drop the message
pub fn decode(
    layout: &TopicLayout,
    topic: &str,
    payload: &[u8],
) -> Result<InboundEvent, DecodeError> {
    if layout.is_announce(topic) {
        let id = decode_announcement(payload)?;
        return Ok(InboundEvent::Connection { id });
    }

    let id = match layout.node_id(topic) {
        Ok(id) => id.to_string(),
        Err(DecodeError::TopicMismatch(t)) => return Err(DecodeError::UnknownTopic(t)),
        Err(e) => return Err(e),
    };
    let reading = decode_reading(payload)?;

    Ok(InboundEvent::Telemetry { id, reading })
}

/// Extract the node id from a connection announcement
///
/// Accepts `{"id":"42"}` as well as `{"id":42}`.
///
/// # Errors
///
/// Returns error if the payload is not a JSON object with a usable `id`
pub fn decode_announcement(payload: &[u8]) -> Result<String, DecodeError> {
    let object = parse_object(payload)?;

    let id = match object.get("id") {
        None => return Err(DecodeError::MissingId),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| n.as_u64().map(|u| u.to_string()))
            .ok_or_else(|| DecodeError::InvalidId(n.to_string()))?,
        Some(other) => return Err(DecodeError::InvalidId(other.to_string())),
    };

    if id.is_empty() {
        return Err(DecodeError::InvalidId("\"\"".to_string()));
    }

    Ok(id)
}

/// Map a telemetry payload into a [`SensorReading`]
///
/// # Errors
///
/// Returns error if the payload is malformed or any of the seven fields is
/// missing or out of range
pub fn decode_reading(payload: &[u8]) -> Result<SensorReading, DecodeError> {
    let object = parse_object(payload)?;

    let seconds = integer_field(&object, "time")?;
    let timestamp = DateTime::from_timestamp(seconds, 0).ok_or_else(|| DecodeError::InvalidField {
        field: "time",
        value: seconds.to_string(),
    })?;

    Ok(SensorReading {
        temperature: float_field(&object, "temp")?,
        pressure: unsigned_field(&object, "pres")?,
        altitude: float_field(&object, "alt")?,
        humidity: unsigned_field(&object, "hum")?,
        illuminance: unsigned_field(&object, "lux")?,
        sound_level: unsigned_field(&object, "soun")?,
        timestamp,
    })
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotAnObject),
    }
}

/// Read a finite number, accepting numeric strings
fn number_field(object: &Map<String, Value>, field: &'static str) -> Result<f64, DecodeError> {
    let value = object.get(field).ok_or(DecodeError::MissingField(field))?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    number
        .filter(|n| n.is_finite())
        .ok_or_else(|| DecodeError::InvalidField {
            field,
            value: value.to_string(),
        })
}

/// Read a number that stays finite as `f32`
#[allow(clippy::cast_possible_truncation)]
fn float_field(object: &Map<String, Value>, field: &'static str) -> Result<f32, DecodeError> {
    let number = number_field(object, field)?;
    let narrowed = number as f32;
    if narrowed.is_finite() {
        Ok(narrowed)
    } else {
        Err(DecodeError::InvalidField {
            field,
            value: number.to_string(),
        })
    }
}

/// Read a signed integer, truncating any fractional part
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integer_field(object: &Map<String, Value>, field: &'static str) -> Result<i64, DecodeError> {
    if let Some(i) = object.get(field).and_then(Value::as_i64) {
        return Ok(i);
    }

    let n = number_field(object, field)?.trunc();
    if n < i64::MIN as f64 || n > i64::MAX as f64 {
        return Err(DecodeError::InvalidField {
            field,
            value: n.to_string(),
        });
    }
    Ok(n as i64)
}

/// Read a non-negative integer that fits `T`
fn unsigned_field<T: TryFrom<i64>>(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<T, DecodeError> {
    let n = integer_field(object, field)?;
    if n < 0 {
        return Err(DecodeError::InvalidField {
            field,
            value: n.to_string(),
        });
    }
    T::try_from(n).map_err(|_| DecodeError::InvalidField {
        field,
        value: n.to_string(),
    })
}
