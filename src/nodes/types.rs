//! Node state types

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::telemetry::SensorReading;

/// Everything the gateway knows about one sensor node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeState {
    pub id: String,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
    /// Whether telemetry from this node may be persisted
    pub allowed: bool,
    pub last_reading: Option<SensorReading>,
}

impl NodeState {
    /// A freshly discovered node: offline, not allowed, no reading
    #[must_use]
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            last_seen: now,
            online: false,
            allowed: false,
            last_reading: None,
        }
    }

    /// Whether the node has been silent for longer than `timeout`
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_seen) > timeout
    }
}

/// Observable transition recorded by the registry
///
/// Emitted once per real change; idempotent writes produce nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// First time this id was seen
    Created { node_id: String },
    /// `online` flipped
    StatusChanged { node_id: String, online: bool },
    /// `allowed` flipped
    PermissionChanged { node_id: String, allowed: bool },
    /// Removed by an administrative delete
    Removed { node_id: String },
}

impl NodeEvent {
    #[must_use]
    pub fn node_id(&self) -> &str {
        match self {
            Self::Created { node_id }
            | Self::StatusChanged { node_id, .. }
            | Self::PermissionChanged { node_id, .. }
            | Self::Removed { node_id } => node_id,
        }
    }
}

/// What a `record_contact` call changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactOutcome {
    /// The node did not exist before this contact
    pub created: bool,
    /// `online` flipped from false to true
    pub came_online: bool,
    /// Permission at the time of contact
    pub allowed: bool,
    /// `last_seen` after the contact, never earlier than before it
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn node_state_serializes_for_listing() {
        let mut node = NodeState::new("7", Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        node.online = true;

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["id"], "7");
        assert_eq!(value["online"], true);
        assert_eq!(value["allowed"], false);
        assert_eq!(value["last_seen"], "2023-11-14T22:13:20Z");
        assert!(value["last_reading"].is_null());
    }
}
