//! High-frequency, best-effort transfer telemetry — distinct from the
//! durable [`broker_types::AuditRecord`] trail: this is per-chunk/per-ack
//! debug noise, not a policy-relevant record. Grounded directly on this
//! codebase's `TransferLogger`/`TracingLogger`/`NullLogger` split.

use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub tid: Uuid,
    pub event: TransferEvent,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    ChunkReceived { seq: u32, size: usize },
    ChunkCorrupt { seq: u32 },
    ChunkAcked { seq: u32 },
    WindowAdjusted { old_window: u32, new_window: u32 },
    Paused,
    Resumed { restart_seq: u32 },
    Completed { total_bytes: u64, duration_ms: u64 },
    Failed { reason: String },
    Cancelled,
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChunkReceived { seq, size } => write!(f, "chunk_received seq={seq} size={size}"),
            Self::ChunkCorrupt { seq } => write!(f, "chunk_corrupt seq={seq}"),
            Self::ChunkAcked { seq } => write!(f, "chunk_acked seq={seq}"),
            Self::WindowAdjusted { old_window, new_window } => {
                write!(f, "window_adjusted old={old_window} new={new_window}")
            }
            Self::Paused => write!(f, "paused"),
            Self::Resumed { restart_seq } => write!(f, "resumed restart_seq={restart_seq}"),
            Self::Completed { total_bytes, duration_ms } => {
                write!(f, "completed bytes={total_bytes} duration_ms={duration_ms}")
            }
            Self::Failed { reason } => write!(f, "failed reason={reason}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::Completed { .. } | TransferEvent::Failed { .. } | TransferEvent::Cancelled => {
                tracing::info!(component = entry.component, tid = %entry.tid, "{}", entry.event);
            }
            _ => {
                tracing::debug!(component = entry.component, tid = %entry.tid, "{}", entry.event);
            }
        }
    }
}

pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
