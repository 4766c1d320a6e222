use broker_types::sid::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {0} is not awaiting pairing")]
    NotAwaitingPair(SessionId),
    #[error("endpoint authentication failed")]
    EndpointAuthFailed,
    #[error("technician authentication failed")]
    TechnicianAuthFailed,
    #[error("global session cap reached")]
    GlobalCapReached,
    #[error("per-endpoint session cap reached")]
    EndpointCapReached,
    #[error("could not allocate a unique session id after {0} attempts")]
    IdAllocationFailed(u32),
}

impl From<&RegistryError> for broker_types::ErrorKind {
    fn from(value: &RegistryError) -> Self {
        use RegistryError::*;
        match value {
            NotFound(_) | NotAwaitingPair(_) => broker_types::ErrorKind::Policy,
            EndpointAuthFailed | TechnicianAuthFailed => broker_types::ErrorKind::Auth,
            GlobalCapReached | EndpointCapReached => broker_types::ErrorKind::ResourceExhausted,
            IdAllocationFailed(_) => broker_types::ErrorKind::Internal,
        }
    }
}
