//! Dispatch for the `transfer_*` frame family (C4), bridging the wire
//! protocol to `broker-transfer`'s engine.
//!
//! The broker is the authoritative receiver-assembler for every transfer
//! regardless of direction: `broker-transfer::TransferEngine` always does
//! the chunk verification and file writing, and this module additionally
//! forwards each verified chunk onward to the human-facing party as a
//! best-effort pass-through, so the eventual recipient sees the bytes
//! without the broker needing a second, direction-specific code path.
//! `transfer_ack` always originates here, never from the ultimate
//! recipient, so it alone drives the sender's sliding window (§4.4).
//!
//! Grounded in the teacher's `haven-file-server::routes::upload_chunk` /
//! `download_data` chunk-validate-then-respond shape, restructured from
//! one chunk per HTTP request into one chunk per `transfer_chunk` frame.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use uuid::Uuid;

use broker_codec::Frame;
use broker_registry::RegisteredSession;
use broker_types::audit::{AuditOutcome, AuditRecord};
use broker_types::error::WireError;
use broker_types::session::ConnectionRole;
use broker_types::transfer::TransferState;
use broker_types::wire::{
    AckStatus, FrameBody, TransferAckBody, TransferChunkBody, TransferControlBody,
    TransferControlKind, TransferProgressBody, TransferRequestBody, TransferResponseBody,
};
use broker_types::ErrorKind;
use broker_transfer::{ChunkOutcome, TransferHandle};

use crate::state::{AppState, ConnLink, RateTracker, SessionLink};

/// Emit a `transfer_progress` frame at most once every this-many chunks
/// (plus always on the final chunk), so progress telemetry doesn't
/// dominate the chunk stream itself.
const PROGRESS_EVERY_N_CHUNKS: u32 = 8;

/// The connection on the opposite side of `role` within a paired session.
/// `None` only if the technician has not attached yet, which cannot
/// happen once a transfer is underway (transfers require an active,
/// paired session).
async fn other_party(link: &Arc<SessionLink>, role: ConnectionRole) -> Option<Arc<ConnLink>> {
    match role {
        ConnectionRole::Endpoint => link.technician.read().await.clone(),
        ConnectionRole::Technician => Some(link.endpoint.clone()),
    }
}

pub async fn handle_transfer_request(
    state: &AppState,
    registered: &Arc<RegisteredSession>,
    link: &Arc<SessionLink>,
    conn: &Arc<ConnLink>,
    role: ConnectionRole,
    req: TransferRequestBody,
) {
    let sid = registered.sid.clone();
    let tid = req.tid;
    let initiator_identity = conn.identity.clone();

    match state
        .transfers
        .initiate(&sid, req.clone(), req.direction, initiator_identity.clone())
        .await
    {
        Err(e) => {
            let kind: ErrorKind = (&e).into();
            state
                .audit
                .append(
                    AuditRecord::new(sid, "transfer_rejected", &initiator_identity, AuditOutcome::Denied)
                        .with_tid(tid)
                        .with_reason(e.to_string()),
                )
                .await;
            let _ = conn
                .tx
                .send(Frame::new(FrameBody::TransferResponse(TransferResponseBody {
                    tid,
                    accept: false,
                    message: Some(e.to_string()),
                })))
                .await;
            let _ = kind;
        }
        Ok(handle) => {
            if state.approval.should_auto_approve(&req) {
                finish_approval(state, &sid, conn.clone(), &handle, true, None).await;
            } else {
                let Some(approver) = other_party(link, role).await else {
                    warn!(sid = %sid, "no approver connected for transfer_request");
                    return;
                };
                let _ = approver
                    .tx
                    .send(Frame::new(FrameBody::TransferRequest(req)))
                    .await;
            }
        }
    }
}

pub async fn handle_transfer_response(
    state: &AppState,
    registered: &Arc<RegisteredSession>,
    link: &Arc<SessionLink>,
    role: ConnectionRole,
    resp: TransferResponseBody,
) {
    let sid = registered.sid.clone();
    let Some(handle) = state.transfers.get(&sid, resp.tid) else {
        warn!(sid = %sid, tid = %resp.tid, "transfer_response for unknown transfer");
        return;
    };
    let Some(sender_link) = other_party(link, role).await else {
        warn!(sid = %sid, "no sender connected for transfer_response");
        return;
    };
    finish_approval(state, &sid, sender_link, &handle, resp.accept, resp.message).await;
}

async fn finish_approval(
    state: &AppState,
    sid: &broker_types::SessionId,
    sender_link: Arc<ConnLink>,
    handle: &Arc<AsyncMutex<TransferHandle>>,
    accept: bool,
    message: Option<String>,
) {
    let tid = handle.lock().await.transfer.tid;

    if state.transfers.approve(handle, accept).await.is_err() {
        warn!(sid = %sid, tid = %tid, "approval arrived for a transfer in the wrong state");
        return;
    }

    let actor = sender_link.identity.clone();
    if accept {
        state
            .audit
            .append(AuditRecord::new(sid.clone(), "transfer_approved", &actor, AuditOutcome::Ok).with_tid(tid))
            .await;
        state
            .rate_trackers
            .insert(tid, AsyncMutex::new(RateTracker::new()));
        let _ = sender_link
            .tx
            .send(Frame::new(FrameBody::TransferResponse(TransferResponseBody {
                tid,
                accept: true,
                message: None,
            })))
            .await;
    } else {
        state
            .audit
            .append(
                AuditRecord::new(sid.clone(), "transfer_rejected", &actor, AuditOutcome::Denied)
                    .with_tid(tid)
                    .with_reason(message.clone().unwrap_or_default()),
            )
            .await;
        state.transfers.retire(sid, tid);
        let _ = sender_link
            .tx
            .send(Frame::new(FrameBody::TransferResponse(TransferResponseBody {
                tid,
                accept: false,
                message,
            })))
            .await;
    }
}

pub async fn handle_transfer_chunk(
    state: &AppState,
    registered: &Arc<RegisteredSession>,
    link: &Arc<SessionLink>,
    conn: &Arc<ConnLink>,
    role: ConnectionRole,
    chunk: TransferChunkBody,
) {
    let sid = registered.sid.clone();
    let tid = chunk.tid;
    let seq = chunk.seq;

    let Some(handle) = state.transfers.get(&sid, tid) else {
        warn!(sid = %sid, tid = %tid, "transfer_chunk for unknown transfer");
        let _ = conn
            .tx
            .send(Frame::new(FrameBody::Error(WireError::new(
                ErrorKind::Protocol,
                "unknown transfer id",
            ))))
            .await;
        return;
    };

    let outcome = {
        let mut guard = handle.lock().await;
        guard
            .on_chunk(chunk.seq, chunk.is_last, chunk.chunk_checksum, &chunk.payload)
            .await
    };

    match outcome {
        Ok(ChunkOutcome::Acked { status }) => {
            let _ = conn
                .tx
                .send(Frame::new(FrameBody::TransferAck(TransferAckBody { tid, seq, status })))
                .await;
            if let Some(receiver) = other_party(link, role).await {
                let _ = receiver.tx.send(Frame::new(FrameBody::TransferChunk(chunk))).await;
            }
            maybe_emit_progress(state, link, role, conn, seq, tid, &handle).await;
        }
        Ok(ChunkOutcome::Completed { final_path: _ }) => {
            let _ = conn
                .tx
                .send(Frame::new(FrameBody::TransferAck(TransferAckBody {
                    tid,
                    seq,
                    status: AckStatus::Ok,
                })))
                .await;
            let receiver = other_party(link, role).await;
            if let Some(receiver) = &receiver {
                let _ = receiver
                    .tx
                    .send(Frame::new(FrameBody::TransferChunk(chunk)))
                    .await;
            }

            let transfer = handle.lock().await.transfer.clone();
            state
                .audit
                .append(
                    AuditRecord::new(sid.clone(), "transfer_completed", &transfer.initiator_identity, AuditOutcome::Ok)
                        .with_tid(tid)
                        .with_bytes(transfer.declared_size),
                )
                .await;

            let done = Frame::new(FrameBody::TransferProgress(TransferProgressBody {
                tid,
                bytes_transferred: transfer.declared_size,
                declared_size: transfer.declared_size,
                speed_bps: 0,
                eta_secs: Some(0),
            }));
            let _ = conn.tx.send(done.clone()).await;
            if let Some(receiver) = &receiver {
                let _ = receiver.tx.send(done).await;
            }

            state.transfers.retire(&sid, tid);
            state.rate_trackers.remove(&tid);
        }
        Ok(ChunkOutcome::ChecksumMismatch) => {
            let fatal = handle.lock().await.transfer.state == TransferState::Failed;
            if fatal {
                let transfer = handle.lock().await.transfer.clone();
                state
                    .audit
                    .append(
                        AuditRecord::new(sid.clone(), "transfer_failed", &transfer.initiator_identity, AuditOutcome::Error)
                            .with_tid(tid)
                            .with_reason("checksum_mismatch"),
                    )
                    .await;
                let err = Frame::new(FrameBody::Error(WireError::new(
                    ErrorKind::Integrity,
                    "transfer failed whole-file checksum verification",
                )));
                let _ = conn.tx.send(err.clone()).await;
                if let Some(receiver) = other_party(link, role).await {
                    let _ = receiver.tx.send(err).await;
                }
                state.transfers.retire(&sid, tid);
                state.rate_trackers.remove(&tid);
            } else {
                let _ = conn
                    .tx
                    .send(Frame::new(FrameBody::TransferAck(TransferAckBody {
                        tid,
                        seq,
                        status: AckStatus::Corrupt,
                    })))
                    .await;
            }
        }
        Err(e) => {
            warn!(sid = %sid, tid = %tid, error = %e, "chunk rejected");
            let kind: ErrorKind = (&e).into();
            let _ = conn
                .tx
                .send(Frame::new(FrameBody::Error(WireError::new(kind, e.to_string()))))
                .await;
        }
    }
}

async fn maybe_emit_progress(
    state: &AppState,
    link: &Arc<SessionLink>,
    role: ConnectionRole,
    sender: &Arc<ConnLink>,
    seq: u32,
    tid: Uuid,
    handle: &Arc<AsyncMutex<TransferHandle>>,
) {
    if (seq + 1) % PROGRESS_EVERY_N_CHUNKS != 0 {
        return;
    }

    let (bytes_transferred, declared_size) = {
        let guard = handle.lock().await;
        (guard.transfer.bytes_transferred, guard.transfer.declared_size)
    };

    let (speed_bps, eta_secs) = {
        let entry = state
            .rate_trackers
            .entry(tid)
            .or_insert_with(|| AsyncMutex::new(RateTracker::new()));
        let mut tracker = entry.lock().await;
        tracker.sample(bytes_transferred, declared_size)
    };

    let progress = Frame::new(FrameBody::TransferProgress(TransferProgressBody {
        tid,
        bytes_transferred,
        declared_size,
        speed_bps,
        eta_secs,
    }));
    let _ = sender.tx.send(progress.clone()).await;
    if let Some(receiver) = other_party(link, role).await {
        let _ = receiver.tx.send(progress).await;
    }
}

pub async fn handle_transfer_control(
    state: &AppState,
    registered: &Arc<RegisteredSession>,
    link: &Arc<SessionLink>,
    role: ConnectionRole,
    ctrl: TransferControlBody,
) {
    let sid = registered.sid.clone();
    let tid = ctrl.tid;

    let Some(handle) = state.transfers.get(&sid, tid) else {
        warn!(sid = %sid, tid = %tid, "transfer_control for unknown transfer");
        return;
    };

    match ctrl.kind {
        TransferControlKind::Pause => {
            let ok = handle.lock().await.pause().is_ok();
            if ok {
                if let Some(other) = other_party(link, role).await {
                    let _ = other.tx.send(Frame::new(FrameBody::TransferControl(ctrl))).await;
                }
            }
        }
        TransferControlKind::Resume => {
            let restart = handle.lock().await.resume();
            if let Ok(restart_seq) = restart {
                if let Some(other) = other_party(link, role).await {
                    let _ = other
                        .tx
                        .send(Frame::new(FrameBody::TransferControl(ctrl)))
                        .await;

                    let (declared_size, chunk_size) = {
                        let guard = handle.lock().await;
                        (guard.transfer.declared_size, guard.transfer.chunk_size as u64)
                    };
                    let _ = other
                        .tx
                        .send(Frame::new(FrameBody::TransferProgress(TransferProgressBody {
                            tid,
                            bytes_transferred: restart_seq as u64 * chunk_size,
                            declared_size,
                            speed_bps: 0,
                            eta_secs: None,
                        })))
                        .await;
                }
            }
        }
        TransferControlKind::Cancel => {
            let transfer = {
                let mut guard = handle.lock().await;
                let _ = guard.cancel().await;
                guard.transfer.clone()
            };
            state
                .audit
                .append(
                    AuditRecord::new(sid.clone(), "transfer_cancelled", &transfer.initiator_identity, AuditOutcome::Ok)
                        .with_tid(tid),
                )
                .await;
            state.transfers.retire(&sid, tid);
            state.rate_trackers.remove(&tid);
            if let Some(other) = other_party(link, role).await {
                let _ = other.tx.send(Frame::new(FrameBody::TransferControl(ctrl))).await;
            }
        }
    }
}
