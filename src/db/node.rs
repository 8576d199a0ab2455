//! Node repository - `SQLite` implementation of [`NodeStore`]

use chrono::Utc;
use rusqlite::{OptionalExtension, Row};

use super::{
    AuditEntry, AuditId, DbConn, DbPool, NodeField, NodeStore, format_timestamp, parse_timestamp,
};
use crate::nodes::NodeState;
use crate::telemetry::SensorReading;
use crate::{Error, Result};

/// Node repository
#[derive(Clone)]
pub struct NodeRepo {
    pool: DbPool,
}

impl NodeRepo {
    /// Create a new node repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub(super) fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Find a single stored node
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<NodeState>> {
        let conn = self.conn()?;
        let node = conn
            .query_row(
                &format!("{SELECT_NODES} WHERE n.id = ?1"),
                [id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }
}

const SELECT_NODES: &str = "SELECT n.id, n.online, n.allowed, n.last_seen, \
     d.timestamp, d.temperature, d.pressure, d.altitude, d.humidity, d.lux, d.sound \
     FROM nodes n LEFT JOIN node_data d ON d.id = n.id";

#[allow(clippy::cast_possible_truncation)]
fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeState> {
    let id: String = row.get(0)?;
    let last_seen_text: Option<String> = row.get(3)?;
    let last_seen = last_seen_text
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(|| {
            tracing::warn!(node_id = %id, value = ?last_seen_text, "unreadable last_seen, using now");
            Utc::now()
        });

    let reading_time: Option<String> = row.get(4)?;
    let last_reading = match reading_time.as_deref().map(parse_timestamp) {
        Some(Some(timestamp)) => Some(SensorReading {
            temperature: row.get::<_, f64>(5)? as f32,
            pressure: row.get(6)?,
            altitude: row.get::<_, f64>(7)? as f32,
            humidity: row.get(8)?,
            illuminance: row.get(9)?,
            sound_level: row.get(10)?,
            timestamp,
        }),
        Some(None) => {
            tracing::warn!(node_id = %id, "unreadable reading timestamp, skipping reading");
            None
        }
        None => None,
    };

    Ok(NodeState {
        id,
        last_seen,
        online: row.get(1)?,
        allowed: row.get(2)?,
        last_reading,
    })
}

impl NodeStore for NodeRepo {
    fn upsert_node(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO nodes (id) VALUES (?1) ON CONFLICT(id) DO NOTHING", [id])?;
        Ok(())
    }

    fn delete_node(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM node_data WHERE id = ?1", [id])?;
        let removed = tx.execute("DELETE FROM nodes WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn update_node_field(&self, id: &str, field: NodeField) -> Result<()> {
        let conn = self.conn()?;
        match field {
            NodeField::Online(value) | NodeField::Allowed(value) => {
                conn.execute(
                    &format!("UPDATE nodes SET {} = ?1 WHERE id = ?2", field.column()),
                    rusqlite::params![value, id],
                )?;
            }
            NodeField::LastSeen(at) => {
                conn.execute(
                    "UPDATE nodes SET last_seen = ?1 WHERE id = ?2",
                    rusqlite::params![format_timestamp(at), id],
                )?;
            }
        }
        Ok(())
    }

    fn upsert_reading(&self, id: &str, reading: &SensorReading) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("INSERT INTO nodes (id) VALUES (?1) ON CONFLICT(id) DO NOTHING", [id])?;
        tx.execute(
            "INSERT INTO node_data (id, timestamp, temperature, pressure, altitude, humidity, lux, sound)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                timestamp = excluded.timestamp,
                temperature = excluded.temperature,
                pressure = excluded.pressure,
                altitude = excluded.altitude,
                humidity = excluded.humidity,
                lux = excluded.lux,
                sound = excluded.sound",
            rusqlite::params![
                id,
                format_timestamp(reading.timestamp),
                f64::from(reading.temperature),
                reading.pressure,
                f64::from(reading.altitude),
                reading.humidity,
                reading.illuminance,
                reading.sound_level,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_all_nodes(&self) -> Result<Vec<NodeState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT_NODES} ORDER BY n.id"))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    fn read_audit_entries(&self) -> Result<Vec<AuditEntry>> {
        self.list_audit_entries()
    }

    fn delete_audit_entries(&self, ids: &[AuditId]) -> Result<usize> {
        self.remove_audit_entries(ids)
    }

    fn purge_audit_entries(&self) -> Result<usize> {
        self.clear_audit_entries()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone};

    use super::*;
    use crate::db::init_memory;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample_reading(secs: i64) -> SensorReading {
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

    fn repo() -> NodeRepo {
        NodeRepo::new(init_memory().unwrap())
    }

    #[test]
    fn upsert_is_idempotent() {
        let repo = repo();
        repo.upsert_node("a").unwrap();
        repo.update_node_field("a", NodeField::Allowed(true)).unwrap();
        repo.upsert_node("a").unwrap();

        let node = repo.find("a").unwrap().unwrap();
        assert!(node.allowed);
        assert_eq!(repo.load_all_nodes().unwrap().len(), 1);
    }

    #[test]
    fn fields_are_written() {
        let repo = repo();
        repo.upsert_node("a").unwrap();
        repo.update_node_field("a", NodeField::Online(true)).unwrap();
        repo.update_node_field("a", NodeField::LastSeen(at(42))).unwrap();

        let node = repo.find("a").unwrap().unwrap();
        assert!(node.online);
        assert!(!node.allowed);
        assert_eq!(node.last_seen, at(42));
    }

    #[test]
    fn readings_are_last_write_wins() {
        let repo = repo();
        repo.upsert_reading("a", &sample_reading(10)).unwrap();
        let mut newer = sample_reading(5);
        newer.pressure = 990;
        repo.upsert_reading("a", &newer).unwrap();

        let node = repo.find("a").unwrap().unwrap();
        assert_eq!(node.last_reading, Some(newer));
    }

    #[test]
    fn delete_cascades_to_readings() {
        let repo = repo();
        repo.upsert_reading("a", &sample_reading(0)).unwrap();
        repo.upsert_node("b").unwrap();

        assert!(repo.delete_node("a").unwrap());
        assert!(!repo.delete_node("a").unwrap());

        let conn = repo.conn().unwrap();
        let readings: i64 = conn
            .query_row("SELECT COUNT(*) FROM node_data", [], |row| row.get(0))
            .unwrap();
        assert_eq!(readings, 0);
        drop(conn);

        let remaining = repo.load_all_nodes().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "b");
    }

    #[test]
    fn load_all_is_ordered_and_joins_readings() {
        let repo = repo();
        repo.upsert_node("z").unwrap();
        repo.upsert_reading("m", &sample_reading(1)).unwrap();

        let nodes = repo.load_all_nodes().unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["m", "z"]);
        assert_eq!(nodes[0].last_reading, Some(sample_reading(1)));
        assert!(nodes[1].last_reading.is_none());
    }

    #[test]
    fn unknown_node_update_is_a_no_op() {
        let repo = repo();
        repo.update_node_field("ghost", NodeField::Online(true)).unwrap();
        assert!(repo.find("ghost").unwrap().is_none());
    }
}
