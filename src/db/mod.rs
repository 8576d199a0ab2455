//! Database module for node, reading, and audit persistence

pub mod audit;
pub mod node;
mod schema;

use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::nodes::NodeState;
use crate::telemetry::SensorReading;
use crate::{Error, Result};

pub use audit::{AuditEntry, AuditId};
pub use node::NodeRepo;
pub use schema::SCHEMA_VERSION;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Calendar format used for every persisted timestamp (local time)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single node column the gateway writes back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeField {
    Online(bool),
    Allowed(bool),
    LastSeen(DateTime<Utc>),
}

impl NodeField {
    /// Column name in the `nodes` table
    #[must_use]
    pub const fn column(&self) -> &'static str {
        match self {
            Self::Online(_) => "online",
            Self::Allowed(_) => "allowed",
            Self::LastSeen(_) => "last_seen",
        }
    }
}

/// Durable storage the gateway mirrors node state into
///
/// Every method may block on I/O; callers must not hold the registry lock
/// while calling into a store.
pub trait NodeStore: Send + Sync {
    /// Insert the node row if it does not exist
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn upsert_node(&self, id: &str) -> Result<()>;

    /// Delete a node and its stored readings in one transaction
    ///
    /// Returns true if a node row was removed.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails; nothing is deleted in that case
    fn delete_node(&self, id: &str) -> Result<bool>;

    /// Write one column of the node row
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn update_node_field(&self, id: &str, field: NodeField) -> Result<()>;

    /// Store the latest reading for a node, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn upsert_reading(&self, id: &str, reading: &SensorReading) -> Result<()>;

    /// Read every stored node with its latest reading
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    fn load_all_nodes(&self) -> Result<Vec<NodeState>>;

    /// Read all pending audit entries, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    fn read_audit_entries(&self) -> Result<Vec<AuditEntry>>;

    /// Delete exactly the given audit entries
    ///
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails; no row is removed in that case
    fn delete_audit_entries(&self, ids: &[AuditId]) -> Result<usize>;

    /// Delete every audit entry
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails
    fn purge_audit_entries(&self) -> Result<usize>;
}

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<DbPool> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
    });
    let pool = Pool::builder()
        .max_size(pool_size.max(1))
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    // Run migrations on first connection
    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "database initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager =
        SqliteConnectionManager::memory().with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}

/// Render an instant as local calendar text
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string()
}

/// Parse local calendar text back into an instant
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
