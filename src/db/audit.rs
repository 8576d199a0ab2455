//! Audit log access
//!
//! The audit table is written by an external authority; the gateway only
//! reads rows and deletes the ones it has consumed.

use super::NodeRepo;
use crate::Result;

/// Row identity of an audit entry
pub type AuditId = i64;

/// A pending permission change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub entry_id: AuditId,
    pub node_id: String,
    pub allowed: bool,
}

impl NodeRepo {
    /// Read all pending audit entries in insertion order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_audit_entries(&self) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT entry_id, node_id, allowed_value FROM audit ORDER BY entry_id")?;

        let entries = stmt
            .query_map([], |row| {
                Ok(AuditEntry {
                    entry_id: row.get(0)?,
                    node_id: row.get(1)?,
                    allowed: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Append an audit entry, returning its row identity
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn append_audit_entry(&self, node_id: &str, allowed: bool) -> Result<AuditId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit (node_id, allowed_value) VALUES (?1, ?2)",
            rusqlite::params![node_id, allowed],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Delete the given entries in one transaction
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn remove_audit_entries(&self, ids: &[AuditId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM audit WHERE entry_id = ?1")?;
            for id in ids {
                removed += stmt.execute([id])?;
            }
        }
        tx.commit()?;

        Ok(removed)
    }

    /// Delete every audit entry
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn clear_audit_entries(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM audit", [])?)
    }
}
