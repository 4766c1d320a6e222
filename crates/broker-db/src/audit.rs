//! Durable audit sink backed by the `audit_log` table. Spec §4.4 makes
//! audit writes best-effort: a failed write must not alter transfer or
//! session state, only be logged on the next successful write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use broker_types::{AuditOutcome, AuditRecord, AuditSink};
use tracing::{error, warn};

use crate::Database;

pub struct SqliteAuditSink {
    db: Arc<Database>,
    /// Set after a write fails, so the next successful write can log that
    /// a gap occurred, per §4.4.
    had_recent_failure: AtomicBool,
}

impl SqliteAuditSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            had_recent_failure: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl AuditSink for SqliteAuditSink {
    async fn append(&self, record: AuditRecord) {
        let db = self.db.clone();
        let outcome_str = match record.outcome {
            AuditOutcome::Ok => "ok",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Error => "error",
        };
        let ts = record.ts.to_rfc3339();
        let sid = record.sid.to_string();
        let tid = record.tid.map(|t| t.to_string());
        let kind = record.kind.clone();
        let actor = record.actor.clone();
        let reason = record.reason.clone();
        let bytes = record.bytes.map(|b| b as i64);

        let result = tokio::task::spawn_blocking(move || {
            db.insert_audit_record(
                &ts,
                &sid,
                tid.as_deref(),
                &kind,
                &actor,
                outcome_str,
                reason.as_deref(),
                bytes,
            )
        })
        .await;

        match result {
            Ok(Ok(())) => {
                if self.had_recent_failure.swap(false, Ordering::SeqCst) {
                    warn!("audit sink recovered after a prior write failure");
                }
            }
            Ok(Err(e)) => {
                self.had_recent_failure.store(true, Ordering::SeqCst);
                error!(error = %e, "failed to persist audit record");
            }
            Err(e) => {
                self.had_recent_failure.store(true, Ordering::SeqCst);
                error!(error = %e, "audit write task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_types::SessionId;

    #[tokio::test]
    async fn append_persists_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("broker.sqlite3")).unwrap());
        let sink = SqliteAuditSink::new(db.clone());

        let sid = SessionId::parse("ABCDEFGHJ").unwrap();
        let record = AuditRecord::new(sid, "transfer_completed", "technician", AuditOutcome::Ok)
            .with_bytes(1024);
        sink.append(record).await;

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
