use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer {0} not found")]
    NotFound(Uuid),
    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),
    #[error("extension not allowed: {0}")]
    ExtensionNotAllowed(String),
    #[error("unsafe filename: {0}")]
    UnsafeFilename(String),
    #[error("chunk size {0} out of range")]
    ChunkSizeOutOfRange(u32),
    #[error("concurrent transfer capacity reached")]
    CapacityReached,
    #[error("transfer request rejected by approver")]
    Rejected,
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: broker_types::TransferState,
        to: broker_types::TransferState,
    },
    #[error("checksum mismatch on completion")]
    ChecksumMismatch,
    #[error("transfer stalled")]
    Stall,
    #[error("io error: {0}")]
    Io(String),
}

impl From<&TransferError> for broker_types::ErrorKind {
    fn from(value: &TransferError) -> Self {
        use TransferError::*;
        match value {
            NotFound(_) | InvalidTransition { .. } => broker_types::ErrorKind::Protocol,
            FileTooLarge(_) | ExtensionNotAllowed(_) | UnsafeFilename(_) | ChunkSizeOutOfRange(_)
            | Rejected => broker_types::ErrorKind::Policy,
            CapacityReached => broker_types::ErrorKind::ResourceExhausted,
            ChecksumMismatch => broker_types::ErrorKind::Integrity,
            Stall => broker_types::ErrorKind::Stall,
            Io(_) => broker_types::ErrorKind::Io,
        }
    }
}
