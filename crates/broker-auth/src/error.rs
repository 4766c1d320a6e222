#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("endpoint authentication failed")]
    EndpointRejected,
    #[error("technician authentication failed")]
    TechnicianRejected,
    #[error("malformed credentials")]
    MalformedCredentials,
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<&AuthError> for broker_types::ErrorKind {
    fn from(_: &AuthError) -> Self {
        broker_types::ErrorKind::Auth
    }
}
