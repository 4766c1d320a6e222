//! Wire-level error taxonomy shared by every crate in the workspace.
//!
//! Each library crate defines its own `thiserror` error enum and converts
//! into [`ErrorKind`] at its boundary; `broker-server` never builds an
//! `ErrorKind` from a raw string.

use serde::{Deserialize, Serialize};

/// The kind carried on the wire in an `error` frame, and recorded in audit
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    Auth,
    Policy,
    ResourceExhausted,
    Integrity,
    Stall,
    SlowPeer,
    PeerClosed,
    Transport,
    Io,
    Internal,
}

/// What a given error is fatal to, used by callers to decide how far to
/// unwind (request / transfer / connection / session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScope {
    Request,
    Transfer,
    Connection,
    Session,
}

impl ErrorKind {
    /// The default unwind scope for this kind, per the error propagation
    /// table: protocol/auth/transport/slow_peer take down the connection
    /// (which takes down the session); policy/resource_exhausted fail only
    /// the request that raised them; integrity/stall fail only the
    /// transfer; internal takes down the session.
    pub fn default_scope(self) -> FaultScope {
        match self {
            ErrorKind::Protocol | ErrorKind::Auth | ErrorKind::Transport | ErrorKind::SlowPeer => {
                FaultScope::Connection
            }
            ErrorKind::Policy | ErrorKind::ResourceExhausted => FaultScope::Request,
            ErrorKind::Integrity | ErrorKind::Stall => FaultScope::Transfer,
            ErrorKind::PeerClosed => FaultScope::Connection,
            ErrorKind::Io => FaultScope::Transfer,
            ErrorKind::Internal => FaultScope::Session,
        }
    }
}

/// Body of an `error` frame. `message` must never contain a filesystem
/// path, token, or other internal detail — it is shown to the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
