pub mod cancel;
pub mod error;
pub mod registry;

pub use cancel::CancellationToken;
pub use error::RegistryError;
pub use registry::{RegisteredSession, SessionRegistry};
