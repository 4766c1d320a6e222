#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Protocol(String),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("io error: {0}")]
    Io(String),
    #[error("encode error: {0}")]
    Encode(String),
}

impl From<&CodecError> for broker_types::ErrorKind {
    fn from(value: &CodecError) -> Self {
        match value {
            CodecError::Protocol(_) | CodecError::FrameTooLarge(_) | CodecError::Encode(_) => {
                broker_types::ErrorKind::Protocol
            }
            CodecError::Io(_) => broker_types::ErrorKind::Transport,
        }
    }
}
