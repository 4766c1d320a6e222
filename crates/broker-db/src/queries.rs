use crate::Database;
use crate::models::{TechnicianRow, UnattendedEndpointRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Technicians --

    pub fn create_technician(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO technicians (id, username, password_hash) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_technician_by_username(&self, username: &str) -> Result<Option<TechnicianRow>> {
        self.with_conn(|conn| query_technician_by_username(conn, username))
    }

    // -- Unattended endpoints --

    /// Inserts or replaces the durable verifier for an unattended endpoint
    /// identity. Per §9's resolved open question, rotation/revocation is
    /// an operational concern outside the broker's state machine: this
    /// call always overwrites whatever verifier was previously stored.
    pub fn upsert_unattended_endpoint(&self, endpoint_id: &str, verifier_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO unattended_endpoints (endpoint_id, verifier_hash)
                 VALUES (?1, ?2)
                 ON CONFLICT(endpoint_id) DO UPDATE SET
                     verifier_hash = excluded.verifier_hash,
                     updated_at = datetime('now')",
                (endpoint_id, verifier_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_unattended_endpoint(&self, endpoint_id: &str) -> Result<Option<UnattendedEndpointRow>> {
        self.with_conn(|conn| query_unattended_endpoint(conn, endpoint_id))
    }

    // -- Audit log --

    pub fn insert_audit_record(
        &self,
        ts: &str,
        sid: &str,
        tid: Option<&str>,
        kind: &str,
        actor: &str,
        outcome: &str,
        reason: Option<&str>,
        bytes: Option<i64>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO audit_log (ts, sid, tid, kind, actor, outcome, reason, bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![ts, sid, tid, kind, actor, outcome, reason, bytes],
            )?;
            Ok(())
        })
    }
}

fn query_technician_by_username(conn: &Connection, username: &str) -> Result<Option<TechnicianRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, password_hash, created_at FROM technicians WHERE username = ?1",
    )?;

    let row = stmt
        .query_row([username], |row| {
            Ok(TechnicianRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password_hash: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_unattended_endpoint(
    conn: &Connection,
    endpoint_id: &str,
) -> Result<Option<UnattendedEndpointRow>> {
    let mut stmt = conn.prepare(
        "SELECT endpoint_id, verifier_hash, created_at, updated_at
         FROM unattended_endpoints WHERE endpoint_id = ?1",
    )?;

    let row = stmt
        .query_row([endpoint_id], |row| {
            Ok(UnattendedEndpointRow {
                endpoint_id: row.get(0)?,
                verifier_hash: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn open_tmp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("broker.sqlite3")).unwrap();
        (dir, db)
    }

    #[test]
    fn technician_round_trips() {
        let (_dir, db) = open_tmp();
        db.create_technician("t1", "alice", "hash").unwrap();
        let row = db.get_technician_by_username("alice").unwrap().unwrap();
        assert_eq!(row.username, "alice");
        assert_eq!(row.password_hash, "hash");
        assert!(db.get_technician_by_username("bob").unwrap().is_none());
    }

    #[test]
    fn unattended_endpoint_upsert_overwrites_verifier() {
        let (_dir, db) = open_tmp();
        db.upsert_unattended_endpoint("ep-1", "verifier-a").unwrap();
        db.upsert_unattended_endpoint("ep-1", "verifier-b").unwrap();
        let row = db.get_unattended_endpoint("ep-1").unwrap().unwrap();
        assert_eq!(row.verifier_hash, "verifier-b");
    }

    #[test]
    fn audit_record_inserts() {
        let (_dir, db) = open_tmp();
        db.insert_audit_record(
            "2026-01-01T00:00:00Z",
            "ABC-DEF-GHJ",
            None,
            "session_registered",
            "endpoint",
            "ok",
            None,
            None,
        )
        .unwrap();
    }
}
