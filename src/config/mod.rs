//! Configuration management
//!
//! Layered as defaults, then the TOML file, then environment variables.
//! CLI flags are applied last by the binary.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::telemetry::{DEFAULT_ANNOUNCE_TOPIC, DEFAULT_DATA_FILTER, TopicLayout};
use crate::{Error, Result};

pub use file::GatewayConfigFile;

/// Default broker address
pub const DEFAULT_BROKER: &str = "localhost:1883";

/// Default MQTT client identifier prefix
pub const DEFAULT_CLIENT_ID: &str = "sensor-gateway";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for gateway state
    pub data_dir: PathBuf,

    /// Broker connection settings
    pub transport: TransportConfig,

    /// Persistent store settings
    pub store: StoreConfig,

    /// Offline detection settings
    pub liveness: LivenessConfig,

    /// Audit log polling settings
    pub reconcile: ReconcileConfig,
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Prefix for per-subscription client ids
    pub client_id: String,
    pub announce_topic: String,
    pub data_topic: String,
    pub keep_alive: Duration,
    /// Buffered inbound messages per subscription
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            announce_topic: DEFAULT_ANNOUNCE_TOPIC.to_string(),
            data_topic: DEFAULT_DATA_FILTER.to_string(),
            keep_alive: Duration::from_secs(20),
            channel_capacity: 64,
        }
    }
}

/// Persistent store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file path
    pub path: PathBuf,
    pub pool_size: u32,
    /// Clear the audit log before serving
    pub purge_audit_on_start: bool,
}

/// Offline detection settings
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Silence after which a node is marked offline
    pub timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Audit log polling settings
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Default data directory: `~/.local/share/sensor-gateway/` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".sensor-gateway"),
        |d| d.data_dir().join("sensor-gateway"),
    )
}

impl Config {
    /// Configuration with every default and the given data directory
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            store: StoreConfig {
                path: data_dir.join("gateway.db"),
                pool_size: 4,
                purge_audit_on_start: false,
            },
            data_dir,
            transport: TransportConfig::default(),
            liveness: LivenessConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }

    /// Load configuration from the config file and the process environment
    ///
    /// An explicit `config_path` must exist and parse; the default location
    /// falls back to defaults with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit file cannot be read, or a value is invalid
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc = match config_path {
            Some(path) => file::read_config_file(path).map_err(|e| {
                Error::Config(format!("failed to load {}: {e}", path.display()))
            })?,
            None => file::load_config_file(),
        };
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Apply a parsed config file and an environment lookup over the defaults
    ///
    /// # Errors
    ///
    /// Returns error if any value is malformed or fails validation
    pub fn resolve(fc: GatewayConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = env("GATEWAY_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);
        let mut config = Self::with_data_dir(data_dir);

        let t = fc.transport;
        if let Some(broker) = env("GATEWAY_BROKER").or(t.broker) {
            config.set_broker(&broker)?;
        }
        if let Some(client_id) = env("GATEWAY_CLIENT_ID").or(t.client_id) {
            config.transport.client_id = client_id;
        }
        if let Some(topic) = t.announce_topic {
            config.transport.announce_topic = topic;
        }
        if let Some(topic) = t.data_topic {
            config.transport.data_topic = topic;
        }
        if let Some(secs) = t.keep_alive_secs {
            config.transport.keep_alive = Duration::from_secs(secs);
        }
        if let Some(capacity) = t.channel_capacity {
            config.transport.channel_capacity = capacity;
        }

        if let Some(path) = env("GATEWAY_DB").or(fc.store.path) {
            config.store.path = PathBuf::from(path);
        }
        if let Some(size) = fc.store.pool_size {
            config.store.pool_size = size;
        }
        if let Some(purge) = fc.store.purge_audit_on_start {
            config.store.purge_audit_on_start = purge;
        }

        if let Some(secs) = env_secs(&env, "GATEWAY_NODE_TIMEOUT_SECS")?.or(fc.liveness.timeout_secs) {
            config.liveness.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) =
            env_secs(&env, "GATEWAY_SWEEP_INTERVAL_SECS")?.or(fc.liveness.sweep_interval_secs)
        {
            config.liveness.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) =
            env_secs(&env, "GATEWAY_RECONCILE_INTERVAL_SECS")?.or(fc.reconcile.interval_secs)
        {
            config.reconcile.interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Replace the broker address from `host:port` text
    ///
    /// # Errors
    ///
    /// Returns error if the address is malformed
    pub fn set_broker(&mut self, broker: &str) -> Result<()> {
        let (host, port) = parse_broker(broker)?;
        self.transport.broker_host = host;
        self.transport.broker_port = port;
        Ok(())
    }

    /// Check values that would make the gateway misbehave
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid setting
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("transport.keep_alive_secs", self.transport.keep_alive),
            ("liveness.timeout_secs", self.liveness.timeout),
            ("liveness.sweep_interval_secs", self.liveness.sweep_interval),
            ("reconcile.interval_secs", self.reconcile.interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.transport.channel_capacity == 0 {
            return Err(Error::Config(
                "transport.channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.transport.client_id.is_empty() {
            return Err(Error::Config("transport.client_id must not be empty".to_string()));
        }
        self.topic_layout()?;
        Ok(())
    }

    /// Topic layout derived from the configured subscriptions
    ///
    /// # Errors
    ///
    /// Returns error if the topics are not usable
    pub fn topic_layout(&self) -> Result<TopicLayout> {
        TopicLayout::new(&self.transport.announce_topic, &self.transport.data_topic)
    }
}

fn env_secs(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    env(key)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key} must be a whole number of seconds, got '{v}'")))
        })
        .transpose()
}

/// Split a broker address into host and port
///
/// Accepts `host:port`, optionally prefixed with `tcp://` or `mqtt://`.
/// A bare host uses port 1883.
///
/// # Errors
///
/// Returns error if the host is empty or the port is not a valid number
pub fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let trimmed = broker.trim();
    let address = trimmed
        .strip_prefix("tcp://")
        .or_else(|| trimmed.strip_prefix("mqtt://"))
        .unwrap_or(trimmed);

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| Error::Config(format!("invalid broker port in '{broker}'")))?;
            (host, port)
        }
        None => (address, 1883),
    };

    if host.is_empty() || host.contains('/') {
        return Err(Error::Config(format!("invalid broker address '{broker}'")));
    }
    Ok((host.to_string(), port))
}
