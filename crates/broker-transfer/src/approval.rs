//! Approval policy interface (§6): decides whether a `transfer_request`
//! auto-approves or must be put to the opposite party.

use async_trait::async_trait;

use broker_types::wire::TransferRequestBody;

#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    fn should_auto_approve(&self, request: &TransferRequestBody) -> bool;

    /// Blocks until the approver responds. `None` means the approver
    /// disconnected or timed out without responding — callers treat this
    /// the same as an explicit reject.
    async fn request_approval(&self, request: &TransferRequestBody) -> Option<bool>;
}

/// Approves everything below `auto_approve_below_bytes`, otherwise always
/// asks. Used when a real interactive approver (the opposite connection)
/// is wired in by `broker-server`; this struct only implements the
/// size-based auto-approve half — the asking half is driven by the
/// connection's own request/response frame exchange, not polled here.
pub struct SizeThresholdPolicy {
    pub auto_approve_below_bytes: u64,
}

#[async_trait]
impl ApprovalPolicy for SizeThresholdPolicy {
    fn should_auto_approve(&self, request: &TransferRequestBody) -> bool {
        request.declared_size < self.auto_approve_below_bytes
    }

    async fn request_approval(&self, _request: &TransferRequestBody) -> Option<bool> {
        None
    }
}
