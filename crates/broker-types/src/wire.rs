//! Frame type tags and body payloads shared between `broker-codec` (which
//! encodes/decodes them) and every crate that needs to name a frame type
//! without depending on the codec's framing details.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WireError;
use crate::sid::SessionId;
use crate::transfer::Direction;

/// The `u8 type` tag in the frame header. Values are stable across
/// versions; a receiver that does not recognize a tag at its own protocol
/// version closes the connection with `error{kind=protocol}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Register = 1,
    RegisterAck = 2,
    PairRequest = 3,
    PairAck = 4,
    Control = 5,
    TransferRequest = 6,
    TransferResponse = 7,
    TransferChunk = 8,
    TransferAck = 9,
    TransferProgress = 10,
    TransferControl = 11,
    Heartbeat = 12,
    Error = 13,
    Close = 14,
}

impl FrameType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Register,
            2 => Self::RegisterAck,
            3 => Self::PairRequest,
            4 => Self::PairAck,
            5 => Self::Control,
            6 => Self::TransferRequest,
            7 => Self::TransferResponse,
            8 => Self::TransferChunk,
            9 => Self::TransferAck,
            10 => Self::TransferProgress,
            11 => Self::TransferControl,
            12 => Self::Heartbeat,
            13 => Self::Error,
            14 => Self::Close,
            _ => return None,
        })
    }
}

/// Classification of a `control` sub-frame, determining the relay's queue
/// drop policy (§4.3): real-time frames may be dropped/coalesced under
/// load, reliable frames never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlClass {
    /// Screen deltas and similar high-frequency, loss-tolerant payloads.
    RealTime,
    /// Input events, acks, and anything that must preserve producer order
    /// and never be dropped.
    Reliable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBody {
    pub endpoint_auth: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAckBody {
    pub sid: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequestBody {
    pub sid: SessionId,
    pub technician_auth: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairAckBody {
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlBody {
    pub class: ControlClass,
    /// Coalescing key: frames with the same `(class, coalesce_key)` may
    /// replace one another in the outbound queue once queue depth exceeds
    /// `H_coalesce`. Ignored for `Reliable` frames.
    pub coalesce_key: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequestBody {
    pub tid: Uuid,
    pub direction: Direction,
    pub filename: String,
    pub declared_size: u64,
    pub declared_checksum: [u8; 32],
    pub chunk_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponseBody {
    pub tid: Uuid,
    pub accept: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferChunkBody {
    pub tid: Uuid,
    pub seq: u32,
    pub is_last: bool,
    pub chunk_checksum: [u8; 32],
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Corrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferAckBody {
    pub tid: Uuid,
    pub seq: u32,
    pub status: AckStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgressBody {
    pub tid: Uuid,
    pub bytes_transferred: u64,
    pub declared_size: u64,
    pub speed_bps: u64,
    pub eta_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferControlKind {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferControlBody {
    pub tid: Uuid,
    pub kind: TransferControlKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub counter: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseBody {
    pub reason: Option<String>,
}

/// The decoded, typed body of a frame — the single switch at the codec
/// boundary that every frame dispatch in the broker goes through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FrameBody {
    Register(RegisterBody),
    RegisterAck(RegisterAckBody),
    PairRequest(PairRequestBody),
    PairAck(PairAckBody),
    Control(ControlBody),
    TransferRequest(TransferRequestBody),
    TransferResponse(TransferResponseBody),
    TransferChunk(TransferChunkBody),
    TransferAck(TransferAckBody),
    TransferProgress(TransferProgressBody),
    TransferControl(TransferControlBody),
    Heartbeat(HeartbeatBody),
    Error(WireError),
    Close(CloseBody),
}

impl FrameBody {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::Register(_) => FrameType::Register,
            FrameBody::RegisterAck(_) => FrameType::RegisterAck,
            FrameBody::PairRequest(_) => FrameType::PairRequest,
            FrameBody::PairAck(_) => FrameType::PairAck,
            FrameBody::Control(_) => FrameType::Control,
            FrameBody::TransferRequest(_) => FrameType::TransferRequest,
            FrameBody::TransferResponse(_) => FrameType::TransferResponse,
            FrameBody::TransferChunk(_) => FrameType::TransferChunk,
            FrameBody::TransferAck(_) => FrameType::TransferAck,
            FrameBody::TransferProgress(_) => FrameType::TransferProgress,
            FrameBody::TransferControl(_) => FrameType::TransferControl,
            FrameBody::Heartbeat(_) => FrameType::Heartbeat,
            FrameBody::Error(_) => FrameType::Error,
            FrameBody::Close(_) => FrameType::Close,
        }
    }
}
