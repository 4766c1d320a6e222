#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("peer did not drain its reliable queue within the backpressure window")]
    SlowPeer,
    #[error("codec error: {0}")]
    Codec(#[from] broker_codec::CodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&RelayError> for broker_types::ErrorKind {
    fn from(value: &RelayError) -> Self {
        match value {
            RelayError::SlowPeer => broker_types::ErrorKind::SlowPeer,
            RelayError::Codec(e) => e.into(),
            RelayError::Io(_) => broker_types::ErrorKind::Transport,
        }
    }
}
