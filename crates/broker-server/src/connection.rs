//! Per-connection handshake and session loop.
//!
//! Grounded in the teacher's `haven-gateway::tcp_relay::handle_connection`
//! (auth handshake, spawn a writer task draining a per-connection outbox,
//! run a read loop against the raw stream, clean up on either side's
//! exit) and `haven-gateway::connection::handle_connection` (split
//! sender/receiver halves, `tokio::select!` between the read loop and the
//! connection's liveness). Generalized from a single post-auth relay loop
//! into the broker's two first-frame handshakes (`register`, `pair_request`)
//! followed by a shared, cancellation-aware frame dispatch loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{info, warn};

use broker_codec::{read_frame, write_frame, Frame};
use broker_registry::{CancellationToken, RegisteredSession};
use broker_types::audit::{AuditOutcome, AuditRecord};
use broker_types::error::{ErrorKind, WireError};
use broker_types::session::ConnectionRole;
use broker_types::sid::SessionId;
use broker_types::wire::{
    CloseBody, FrameBody, PairAckBody, PairRequestBody, RegisterAckBody, RegisterBody,
};

use crate::state::{AppState, ConnLink, SessionLink, CONN_OUTBOX_CAPACITY};
use crate::transfer_dispatch;

/// Drives one connection end to end: reads the first frame as the
/// handshake, then (on success) runs the session loop until the peer
/// disconnects or the session is torn down.
pub async fn handle_connection<S>(state: AppState, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = split(stream);

    let first = match read_frame(&mut reader).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "malformed first frame");
            return;
        }
    };

    match first.body {
        FrameBody::Register(body) => handle_register(state, reader, writer, body).await,
        FrameBody::PairRequest(body) => handle_pair(state, reader, writer, body).await,
        _ => {
            warn!("first frame was neither register nor pair_request, closing");
            let mut writer = writer;
            let _ = write_frame(
                &mut writer,
                &Frame::new(FrameBody::Error(WireError::new(
                    ErrorKind::Protocol,
                    "expected register or pair_request as the first frame",
                ))),
            )
            .await;
        }
    }
}

async fn handle_register<R, W>(state: AppState, mut reader: R, mut writer: W, body: RegisterBody)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let identity = match state.auth.authenticate_endpoint(&body.endpoint_auth).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "endpoint authentication failed");
            let _ = write_frame(
                &mut writer,
                &Frame::new(FrameBody::Error(WireError::new(
                    ErrorKind::Auth,
                    "endpoint authentication failed",
                ))),
            )
            .await;
            return;
        }
    };

    let registered = match state.registry.register(identity.clone()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "endpoint registration rejected");
            let kind: ErrorKind = (&e).into();
            let _ = write_frame(
                &mut writer,
                &Frame::new(FrameBody::Error(WireError::new(kind, e.to_string()))),
            )
            .await;
            return;
        }
    };

    let sid = registered.sid.clone();
    let (tx, rx) = mpsc::channel(CONN_OUTBOX_CAPACITY);
    let conn = Arc::new(ConnLink::new(tx, identity.clone()));
    let link = Arc::new(SessionLink::new(conn.clone()));
    state.links.insert(sid.clone(), link.clone());

    spawn_writer(writer, rx, registered.cancel.clone());

    if conn
        .tx
        .send(Frame::new(FrameBody::RegisterAck(RegisterAckBody {
            sid: sid.clone(),
        })))
        .await
        .is_err()
    {
        return;
    }

    state
        .audit
        .append(AuditRecord::new(
            sid.clone(),
            "session_registered",
            &identity,
            AuditOutcome::Ok,
        ))
        .await;
    info!(sid = %sid, endpoint = %identity, "endpoint registered");

    run_session_loop(state.clone(), registered, link, conn, &mut reader, ConnectionRole::Endpoint).await;
}

async fn handle_pair<R, W>(state: AppState, mut reader: R, mut writer: W, body: PairRequestBody)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let sid = body.sid;

    let identity = match state.auth.authenticate_technician(&body.technician_auth).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "technician authentication failed");
            let _ = write_frame(
                &mut writer,
                &Frame::new(FrameBody::PairAck(PairAckBody {
                    accepted: false,
                    reason: Some("authentication failed".into()),
                })),
            )
            .await;
            return;
        }
    };

    let registered = match state.registry.pair(&sid, identity.clone()).await {
        Ok(s) => s,
        Err(e) => {
            warn!(sid = %sid, error = %e, "pairing rejected");
            let _ = write_frame(
                &mut writer,
                &Frame::new(FrameBody::PairAck(PairAckBody {
                    accepted: false,
                    reason: Some(e.to_string()),
                })),
            )
            .await;
            return;
        }
    };

    let Some(link) = state.links.get(&sid).map(|e| e.clone()) else {
        warn!(sid = %sid, "paired session has no connection link, dropping");
        return;
    };

    let (tx, rx) = mpsc::channel(CONN_OUTBOX_CAPACITY);
    let conn = Arc::new(ConnLink::new(tx, identity.clone()));
    *link.technician.write().await = Some(conn.clone());

    spawn_writer(writer, rx, registered.cancel.clone());

    if conn
        .tx
        .send(Frame::new(FrameBody::PairAck(PairAckBody {
            accepted: true,
            reason: None,
        })))
        .await
        .is_err()
    {
        return;
    }

    spawn_relay_bridges(&link, registered.cancel.clone());

    state
        .audit
        .append(AuditRecord::new(
            sid.clone(),
            "session_paired",
            &identity,
            AuditOutcome::Ok,
        ))
        .await;
    info!(sid = %sid, technician = %identity, "technician paired");

    run_session_loop(state.clone(), registered, link, conn, &mut reader, ConnectionRole::Technician).await;
}

/// Bridges each direction's relay queue into the matching connection's
/// outbox, so `control` frames routed by `route_control_frame` actually
/// reach the socket through the single writer task owning that socket.
fn spawn_relay_bridges(link: &Arc<SessionLink>, cancel: CancellationToken) {
    let relay = link.relay.clone();
    let endpoint = link.endpoint.clone();
    let cancel_e = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_e.cancelled() => return,
                body = relay.to_endpoint.recv() => {
                    let Some(body) = body else { return };
                    if endpoint.tx.send(Frame::new(FrameBody::Control(body))).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let relay = link.relay.clone();
    let link = link.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                body = relay.to_technician.recv() => {
                    let Some(body) = body else { return };
                    let Some(tech) = link.technician.read().await.clone() else { return };
                    if tech.tx.send(Frame::new(FrameBody::Control(body))).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

/// Drains a connection's outbox onto the socket. The only writer of this
/// socket for the lifetime of the connection, so frames from the relay
/// bridge, the transfer dispatch, and the handshake ack never interleave.
fn spawn_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Frame>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                frame = rx.recv() => {
                    let Some(frame) = frame else { return };
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        warn!(error = %e, "connection writer failed");
                        return;
                    }
                }
            }
        }
    });
}

/// Shared post-handshake loop: reads frames until cancellation or a clean
/// peer close, dispatching each to the right handler.
async fn run_session_loop<R>(
    state: AppState,
    registered: Arc<RegisteredSession>,
    link: Arc<SessionLink>,
    conn: Arc<ConnLink>,
    reader: &mut R,
    role: ConnectionRole,
) where
    R: AsyncRead + Unpin,
{
    let sid = registered.sid.clone();

    loop {
        tokio::select! {
            _ = registered.cancel.cancelled() => break,
            frame = read_frame(reader) => {
                match frame {
                    Ok(Some(frame)) => {
                        conn.touch();
                        registered.touch();
                        if dispatch_frame(&state, &registered, &link, &conn, role, frame.body).await.is_break() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(sid = %sid, error = %e, "frame read failed, closing connection");
                        break;
                    }
                }
            }
        }
    }

    terminate_session(&state, &sid, "connection_closed").await;
}

/// `Break` ends this connection's read loop (protocol violation or
/// explicit close); `Continue` keeps reading.
enum Flow {
    Continue,
    Break,
}

impl Flow {
    fn is_break(&self) -> bool {
        matches!(self, Flow::Break)
    }
}

async fn dispatch_frame(
    state: &AppState,
    registered: &Arc<RegisteredSession>,
    link: &Arc<SessionLink>,
    conn: &Arc<ConnLink>,
    role: ConnectionRole,
    body: FrameBody,
) -> Flow {
    let sid = &registered.sid;
    match body {
        FrameBody::Heartbeat(_) => Flow::Continue,

        FrameBody::Control(ctrl) => {
            let out = match role {
                ConnectionRole::Endpoint => &link.relay.to_technician,
                ConnectionRole::Technician => &link.relay.to_endpoint,
            };
            if let Err(e) = broker_relay::route_control_frame(out, ctrl, state.config.t_backpressure).await {
                warn!(sid = %sid, error = %e, "relay backpressure exceeded, terminating session");
                Flow::Break
            } else {
                Flow::Continue
            }
        }

        FrameBody::TransferRequest(req) => {
            transfer_dispatch::handle_transfer_request(state, registered, link, conn, role, req).await;
            Flow::Continue
        }
        FrameBody::TransferResponse(resp) => {
            transfer_dispatch::handle_transfer_response(state, registered, link, role, resp).await;
            Flow::Continue
        }
        FrameBody::TransferChunk(chunk) => {
            transfer_dispatch::handle_transfer_chunk(state, registered, link, conn, role, chunk).await;
            Flow::Continue
        }
        FrameBody::TransferControl(ctrl) => {
            transfer_dispatch::handle_transfer_control(state, registered, link, role, ctrl).await;
            Flow::Continue
        }

        FrameBody::Error(err) => {
            warn!(sid = %sid, kind = ?err.kind, message = %err.message, "peer reported a terminal error");
            Flow::Break
        }
        FrameBody::Close(CloseBody { reason }) => {
            info!(sid = %sid, reason = ?reason, "peer closed");
            Flow::Break
        }

        FrameBody::Register(_)
        | FrameBody::RegisterAck(_)
        | FrameBody::PairRequest(_)
        | FrameBody::PairAck(_)
        | FrameBody::TransferAck(_)
        | FrameBody::TransferProgress(_) => {
            warn!(sid = %sid, "unexpected frame type after handshake, protocol violation");
            let out_tx = &conn.tx;
            let _ = out_tx
                .send(Frame::new(FrameBody::Error(WireError::new(
                    ErrorKind::Protocol,
                    "unexpected frame type for this connection's state",
                ))))
                .await;
            Flow::Break
        }
    }
}

/// Idempotent session teardown. Safe to call from either connection's
/// exit path; the registry and transfer engine both no-op on an unknown
/// `sid`.
pub async fn terminate_session(state: &AppState, sid: &SessionId, reason: &str) {
    let cancelled_transfers = state.transfers.cancel_all(sid).await;
    for (tid, transfer) in cancelled_transfers {
        state.rate_trackers.remove(&tid);
        state
            .audit
            .append(
                AuditRecord::new(sid.clone(), "transfer_cancelled", &transfer.initiator_identity, AuditOutcome::Ok)
                    .with_tid(tid)
                    .with_reason("session_terminated"),
            )
            .await;
    }

    state.registry.terminate(sid, reason).await;
    state.links.remove(sid);
}

/// Heartbeat watchdog (spec §… "heartbeat every T_hb; missing two
/// consecutive heartbeats triggers `slow_peer` termination"). Driven by a
/// periodic ticker in `main.rs` at `t_hb` cadence, independent of the
/// registry's coarser `t_idle` session-level reap.
pub async fn reap_stale_heartbeats(state: &AppState, t_hb: Duration) {
    let threshold = t_hb * 2;
    let sids: Vec<SessionId> = state.links.iter().map(|e| e.key().clone()).collect();

    for sid in sids {
        let Some(link) = state.links.get(&sid).map(|e| e.clone()) else {
            continue;
        };

        if link.endpoint.idle_for() >= threshold {
            warn!(sid = %sid, "endpoint missed two heartbeats, terminating session");
            terminate_session(state, &sid, "slow_peer").await;
            continue;
        }

        let technician = link.technician.read().await.clone();
        if let Some(tech) = technician {
            if tech.idle_for() >= threshold {
                warn!(sid = %sid, "technician missed two heartbeats, terminating session");
                terminate_session(state, &sid, "slow_peer").await;
            }
        }
    }
}

/// Stall-timeout sweep (§4.4 item 7: no chunk/ack progress within
/// `T_stall` while `in_progress` fails the transfer). Driven by a
/// periodic ticker in `main.rs`; the engine only transitions state, this
/// function does the audit/notify/retire side effects the same way
/// `transfer_dispatch` does for every other terminal transfer outcome.
pub async fn reap_stalled_transfers(state: &AppState) {
    let stalled = state.transfers.reap_stalled().await;
    for (sid, transfer) in stalled {
        let tid = transfer.tid;
        state.rate_trackers.remove(&tid);
        state
            .audit
            .append(
                AuditRecord::new(sid.clone(), "transfer_failed", &transfer.initiator_identity, AuditOutcome::Error)
                    .with_tid(tid)
                    .with_reason("stall"),
            )
            .await;

        let err = Frame::new(FrameBody::Error(WireError::new(
            ErrorKind::Stall,
            "transfer failed: no progress within the stall timeout",
        )));
        if let Some(link) = state.links.get(&sid).map(|e| e.clone()) {
            let _ = link.endpoint.tx.send(err.clone()).await;
            if let Some(tech) = link.technician.read().await.clone() {
                let _ = tech.tx.send(err).await;
            }
        }

        state.transfers.retire(&sid, tid);
    }
}
