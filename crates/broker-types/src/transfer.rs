use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sid::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Technician pushes a file to the endpoint.
    Upload,
    /// Endpoint pushes a file to the technician.
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Approved,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Failed
                | TransferState::Cancelled
                | TransferState::Rejected
        )
    }

    /// Whether `self -> next` is a legal transition per the lifecycle in
    /// §4.4: `pending -> approved -> in_progress <-> paused -> {terminal}`,
    /// with `pending -> rejected` and any non-terminal state able to move
    /// directly to `cancelled`.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Approved) => true,
            (Pending, Rejected) => true,
            (Approved, InProgress) => true,
            (InProgress, Paused) => true,
            (Paused, InProgress) => true,
            (_, Cancelled) => true,
            (InProgress, Completed) => true,
            (InProgress, Failed) => true,
            (Approved, Failed) => true,
            (Pending, Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    ChecksumMismatch,
    Stall,
    Cancelled,
    SessionTerminated,
    Capacity,
    Policy,
    Io,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub tid: Uuid,
    pub sid: SessionId,
    pub direction: Direction,
    pub filename: String,
    pub declared_size: u64,
    pub declared_checksum: [u8; 32],
    pub chunk_size: u32,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub initiator_identity: String,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub last_progress_at: DateTime<Utc>,
    pub terminal_reason: Option<TerminalReason>,
}

impl Transfer {
    pub fn chunk_count(&self) -> u32 {
        ((self.declared_size + self.chunk_size as u64 - 1) / self.chunk_size as u64) as u32
    }
}
