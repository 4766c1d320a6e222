//! Structured audit record emitted on every terminal transition and
//! approval decision. Grounded in the append-only, best-effort logging
//! shape this codebase already uses for transfer telemetry, generalized
//! into a durable, policy-relevant record rather than a debug trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sid::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub sid: SessionId,
    pub tid: Option<Uuid>,
    pub kind: String,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub bytes: Option<u64>,
}

impl AuditRecord {
    pub fn new(sid: SessionId, kind: impl Into<String>, actor: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            ts: Utc::now(),
            sid,
            tid: None,
            kind: kind.into(),
            actor: actor.into(),
            outcome,
            reason: None,
            bytes: None,
        }
    }

    pub fn with_tid(mut self, tid: Uuid) -> Self {
        self.tid = Some(tid);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

/// Append-only audit sink (§6). Implementations must not let a failed
/// write alter caller state; `append` itself is best-effort and logs its
/// own failure rather than propagating one, per §4.4's audit emission
/// rule.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord);
}

/// Zero-persistence sink: every record is logged via `tracing` and
/// nothing else. Used when no durable audit trail is configured.
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, record: AuditRecord) {
        tracing::info!(
            sid = %record.sid,
            tid = ?record.tid,
            kind = %record.kind,
            actor = %record.actor,
            outcome = ?record.outcome,
            reason = ?record.reason,
            bytes = ?record.bytes,
            "audit"
        );
    }
}
