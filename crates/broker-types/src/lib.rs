pub mod audit;
pub mod config;
pub mod error;
pub mod session;
pub mod sid;
pub mod transfer;
pub mod wire;

pub use audit::{AuditOutcome, AuditRecord, AuditSink, TracingAuditSink};
pub use config::BrokerConfig;
pub use error::{ErrorKind, FaultScope};
pub use session::{Session, SessionState};
pub use sid::SessionId;
pub use transfer::{Direction, Transfer, TransferState};
