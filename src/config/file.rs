//! TOML configuration file loading
//!
//! Supports `~/.config/sensor-gateway/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct GatewayConfigFile {
    /// Directory for gateway state (database)
    pub data_dir: Option<String>,

    /// Broker connection and subscriptions
    #[serde(default)]
    pub transport: TransportFileConfig,

    /// Persistent store
    #[serde(default)]
    pub store: StoreFileConfig,

    /// Offline detection
    #[serde(default)]
    pub liveness: LivenessFileConfig,

    /// Audit log polling
    #[serde(default)]
    pub reconcile: ReconcileFileConfig,
}

/// Broker configuration
#[derive(Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    /// Broker address as `host:port`
    pub broker: Option<String>,
    /// Client identifier prefix
    pub client_id: Option<String>,
    /// Topic nodes announce themselves on
    pub announce_topic: Option<String>,
    /// Telemetry filter with a single `+` level for the node id
    pub data_topic: Option<String>,
    pub keep_alive_secs: Option<u64>,
    /// Buffered inbound messages per subscription
    pub channel_capacity: Option<usize>,
}

/// Store configuration
#[derive(Debug, Default, Deserialize)]
pub struct StoreFileConfig {
    /// Database file path
    pub path: Option<String>,
    pub pool_size: Option<u32>,
    /// Clear the audit log before serving
    pub purge_audit_on_start: Option<bool>,
}

/// Liveness configuration
#[derive(Debug, Default, Deserialize)]
pub struct LivenessFileConfig {
    /// Silence after which a node is considered offline
    pub timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

/// Reconciler configuration
#[derive(Debug, Default, Deserialize)]
pub struct ReconcileFileConfig {
    pub interval_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `GatewayConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> GatewayConfigFile {
    let Some(path) = config_file_path() else {
        return GatewayConfigFile::default();
    };

    if !path.exists() {
        return GatewayConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            GatewayConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<GatewayConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/sensor-gateway/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("sensor-gateway").join("config.toml"))
}
