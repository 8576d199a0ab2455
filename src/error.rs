//! Error types for the sensor gateway

use thiserror::Error;

use crate::telemetry::DecodeError;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the sensor gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound message could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Operation referenced a node the registry does not know
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Transport (MQTT) error
    #[error("transport error: {0}")]
    Transport(String),

    /// Fatal failure while bringing the gateway up
    #[error("startup error: {0}")]
    Startup(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
