//! Shared test utilities

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use sensor_gateway::db::{AuditEntry, AuditId, NodeField, NodeRepo, NodeStore};
use sensor_gateway::{DbPool, Error, NodeState, Result, SensorReading, db};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Fixed instant `secs` seconds after a reference point
#[must_use]
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// A plausible reading taken at `at(secs)`
#[must_use]
pub fn sample_reading(secs: i64) -> SensorReading {
    SensorReading {
        temperature: 21.5,
        pressure: 1013,
        altitude: 120.0,
        humidity: 55,
        illuminance: 300,
        sound_level: 40,
        timestamp: at(secs),
    }
}

/// Store double that fails selected operations on demand
pub struct FlakyStore {
    pub inner: NodeRepo,
    pub fail_writes: AtomicBool,
    pub fail_audit_read: AtomicBool,
    pub fail_audit_delete: AtomicBool,
    /// Appended to the audit log right after the next audit read
    pub late_entry: Mutex<Option<(String, bool)>>,
    /// Runs once, just before the next node write reaches the store
    before_next_write: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FlakyStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: NodeRepo::new(setup_test_db()),
            fail_writes: AtomicBool::new(false),
            fail_audit_read: AtomicBool::new(false),
            fail_audit_delete: AtomicBool::new(false),
            late_entry: Mutex::new(None),
            before_next_write: Mutex::new(None),
        })
    }

    /// Interleave `f` with the next node write
    pub fn before_next_write(&self, f: impl FnOnce() + Send + 'static) {
        *self.before_next_write.lock().unwrap() = Some(Box::new(f));
    }

    fn run_before_write(&self) {
        let hook = self.before_next_write.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::Database("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl NodeStore for FlakyStore {
    fn upsert_node(&self, id: &str) -> Result<()> {
        self.run_before_write();
        Self::check(&self.fail_writes)?;
        self.inner.upsert_node(id)
    }

    fn delete_node(&self, id: &str) -> Result<bool> {
        Self::check(&self.fail_writes)?;
        self.inner.delete_node(id)
    }

    fn update_node_field(&self, id: &str, field: NodeField) -> Result<()> {
        self.run_before_write();
        Self::check(&self.fail_writes)?;
        self.inner.update_node_field(id, field)
    }

    fn upsert_reading(&self, id: &str, reading: &SensorReading) -> Result<()> {
        self.run_before_write();
        Self::check(&self.fail_writes)?;
        self.inner.upsert_reading(id, reading)
    }

    fn load_all_nodes(&self) -> Result<Vec<NodeState>> {
        self.inner.load_all_nodes()
    }

    fn read_audit_entries(&self) -> Result<Vec<AuditEntry>> {
        Self::check(&self.fail_audit_read)?;
        let entries = self.inner.read_audit_entries()?;
        if let Some((node_id, allowed)) = self.late_entry.lock().unwrap().take() {
            self.inner.append_audit_entry(&node_id, allowed)?;
        }
        Ok(entries)
    }

    fn delete_audit_entries(&self, ids: &[AuditId]) -> Result<usize> {
        Self::check(&self.fail_audit_delete)?;
        self.inner.delete_audit_entries(ids)
    }

    fn purge_audit_entries(&self) -> Result<usize> {
        self.inner.purge_audit_entries()
    }
}
