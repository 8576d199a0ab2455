//! Sensor Gateway - liveness and permission tracking for MQTT sensor nodes
//!
//! This library provides the core functionality for the gateway:
//! - Decoding node announcements and telemetry
//! - An in-memory node registry mirrored into `SQLite`
//! - Offline detection for silent nodes
//! - Applying externally recorded permission changes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   MQTT Broker                        │
//! │        client/accepted  │  Nodes/+/Data              │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Sensor Gateway                       │
//! │  Transport → Ingestor → Registry ← Monitor/Reconciler│
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                SQLite Store                          │
//! │        nodes  │  node_data  │  audit                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod ingest;
pub mod nodes;
pub mod telemetry;
pub mod transport;

pub use clock::MonotonicClock;
pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool, NodeRepo, NodeStore};
pub use error::{Error, Result};
pub use ingest::{IngestOutcome, Ingestor};
pub use nodes::{LivenessMonitor, NodeEvent, NodeRegistry, NodeState, PermissionReconciler};
pub use telemetry::{DecodeError, InboundEvent, SensorReading, TopicLayout};
pub use transport::{Subscription, TransportEvent};
