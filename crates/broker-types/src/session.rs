use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sid::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingPair,
    Active,
    Terminating,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    Endpoint,
    Technician,
}

/// Immutable identity fields of a session. Mutable state (the state enum,
/// connection handles, owned transfers) lives in `broker-registry`; this
/// type is the plain data record used for audit/logging and for the
/// `lookup` read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub sid: SessionId,
    pub created_at: DateTime<Utc>,
    pub endpoint_fingerprint: String,
    pub technician_identity: Option<String>,
    pub state: SessionState,
}

impl Session {
    pub fn new(sid: SessionId, endpoint_fingerprint: String) -> Self {
        Self {
            sid,
            created_at: Utc::now(),
            endpoint_fingerprint,
            technician_identity: None,
            state: SessionState::AwaitingPair,
        }
    }
}
