//! Decoded telemetry types

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A sensor snapshot reported by a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// Degrees Celsius
    pub temperature: f32,
    /// Hectopascal
    pub pressure: u32,
    /// Meters
    pub altitude: f32,
    /// Relative humidity in percent
    pub humidity: u32,
    pub illuminance: u32,
    pub sound_level: u16,
    /// Timestamp embedded by the device
    pub timestamp: DateTime<Utc>,
}

/// A successfully decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A node announced itself on the connection topic
    Connection { id: String },
    /// A node published a sensor reading on its data topic
    Telemetry { id: String, reading: SensorReading },
}

impl InboundEvent {
    /// Node id the event refers to
    #[must_use]
    pub fn node_id(&self) -> &str {
        match self {
            Self::Connection { id } | Self::Telemetry { id, .. } => id,
        }
    }

    /// The reading carried by the event, if any
    #[must_use]
    pub const fn reading(&self) -> Option<&SensorReading> {
        match self {
            Self::Connection { .. } => None,
            Self::Telemetry { reading, .. } => Some(reading),
        }
    }
}
