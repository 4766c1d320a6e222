//! Library surface for `broker-server`.
//!
//! The binary (`src/main.rs`) and the `tests/` integration suite both
//! build on these same modules — the binary wires them up against a real
//! TLS listener, the tests wire them up against a bare TCP loopback.

pub mod connection;
pub mod state;
pub mod tls;
pub mod transfer_dispatch;
