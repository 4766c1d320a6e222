//! Transfer engine: chunked, acknowledged file streaming between a
//! paired endpoint and technician, relayed through the broker.
//!
//! - Per-chunk bitfield tracking of what's been received
//! - Sliding-window (AIMD-like) flow control driven by per-chunk acks
//! - SHA-256 integrity verification per chunk and for the whole file
//! - Pause/resume (resuming at the lowest unacknowledged chunk, no resend)
//! - Strict per-session and global concurrency caps

pub mod approval;
pub mod bitfield;
pub mod engine;
pub mod error;
pub mod logging;
pub mod storage;
pub mod window;

pub use approval::{ApprovalPolicy, SizeThresholdPolicy};
pub use bitfield::ChunkBitfield;
pub use engine::{ChunkOutcome, TransferEngine, TransferHandle, TransferPolicy};
pub use error::TransferError;
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use storage::Storage;
pub use window::SlidingWindow;
