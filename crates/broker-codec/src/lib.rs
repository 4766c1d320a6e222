//! Wire codec: length-prefixed binary frames over a TLS duplex.
//!
//! Frame layout: `u32 length (BE) | u8 type | u8 version | body`, where
//! `length` counts only the bytes that follow it (type + version + body).
//! Bodies are encoded with `bincode`'s fixed, deterministic layout rather
//! than JSON — this is a binary framed protocol, not an HTTP API.

mod error;

pub use error::CodecError;

use bincode::Options;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use broker_types::wire::{FrameBody, FrameType};

/// Frames larger than this are rejected as malformed before the body is
/// even read off the wire.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Negotiable chunk size bounds for a transfer, per §4.1.
pub const CHUNK_SIZE_MIN: u32 = 16 * 1024;
pub const CHUNK_SIZE_MAX: u32 = 1024 * 1024;

/// The protocol version this build of the broker speaks. A frame with a
/// lower version is decoded as-is; a frame with a higher version is
/// allowed to carry fields this build doesn't know about (ignored), per
/// §4.1's forward-compatibility rule.
pub const PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 1;

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// A decoded frame: its type/version header plus the typed body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u8,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(body: FrameBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            body,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }
}

/// Per-chunk integrity hash over the payload alone, independent of any
/// whole-file checksum.
pub fn chunk_checksum(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Encode a frame to its wire representation (header + body).
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let body_bytes = bincode_options()
        .serialize(&frame.body)
        .map_err(|e| CodecError::Encode(e.to_string()))?;

    let total_len = 1 + 1 + body_bytes.len();
    if total_len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(total_len));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body_bytes.len());
    out.extend_from_slice(&(total_len as u32).to_be_bytes());
    out.push(frame.frame_type() as u8);
    out.push(frame.version);
    out.extend_from_slice(&body_bytes);
    Ok(out)
}

/// Write a frame to an async sink, one write call for the header+type+version
/// prefix and one for the body — never interleaved with another frame's
/// bytes (callers must serialize writes per connection, e.g. via a single
/// writer task).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), CodecError> {
    let bytes = encode(frame)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| CodecError::Io(e.to_string()))?;
    Ok(())
}

/// Read one frame from an async source. Returns `Ok(None)` on a clean EOF
/// before any header byte is read (peer closed). A malformed length,
/// oversize frame, or unknown type is a [`CodecError::Protocol`] variant —
/// callers must close the connection with `error{kind=protocol}` in
/// response, per §4.1.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, CodecError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CodecError::Io(e.to_string())),
    }
    let total_len = u32::from_be_bytes(len_buf);

    if total_len < 2 {
        return Err(CodecError::Protocol("frame shorter than header".into()));
    }
    if total_len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(total_len as usize));
    }

    let mut rest = vec![0u8; total_len as usize];
    reader
        .read_exact(&mut rest)
        .await
        .map_err(|e| CodecError::Io(e.to_string()))?;

    let type_tag = rest[0];
    let version = rest[1];
    let body_bytes = &rest[2..];

    let frame_type = FrameType::from_u8(type_tag)
        .ok_or_else(|| CodecError::Protocol(format!("unknown frame type {type_tag:#x}")))?;

    let body: FrameBody = bincode_options()
        .deserialize(body_bytes)
        .map_err(|e| CodecError::Protocol(format!("malformed body for {frame_type:?}: {e}")))?;

    if body.frame_type() as u8 != type_tag {
        return Err(CodecError::Protocol("type tag / body mismatch".into()));
    }

    Ok(Some(Frame { version, body }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_types::wire::{HeartbeatBody, RegisterBody};

    #[tokio::test]
    async fn round_trips_a_frame_over_an_in_memory_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let sent = Frame::new(FrameBody::Register(RegisterBody {
            endpoint_auth: vec![1, 2, 3, 4],
        }));
        write_frame(&mut client, &sent).await.unwrap();
        drop(client);

        let got = read_frame(&mut server).await.unwrap().unwrap();
        match got.body {
            FrameBody::Register(b) => assert_eq!(b.endpoint_auth, vec![1, 2, 3, 4]),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_oversize_frame_header() {
        let (mut client, mut server) = tokio::io::duplex(16);
        let huge_len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        client.write_all(&huge_len).await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_frame_type() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // length=2 (type+version), type=0xFF (unknown), version=1
        client.write_all(&2u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xFF, 1]).await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::Protocol(_)));
    }

    #[tokio::test]
    async fn clean_eof_before_any_header_returns_none() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[test]
    fn chunk_checksum_is_deterministic_and_sensitive_to_payload() {
        let a = chunk_checksum(b"hello");
        let b = chunk_checksum(b"hello");
        let c = chunk_checksum(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn heartbeat_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let sent = Frame::new(FrameBody::Heartbeat(HeartbeatBody { counter: 42 }));
        write_frame(&mut client, &sent).await.unwrap();
        drop(client);
        let got = read_frame(&mut server).await.unwrap().unwrap();
        match got.body {
            FrameBody::Heartbeat(b) => assert_eq!(b.counter, 42),
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
