//! End-to-end coverage over a real (non-TLS) TCP loopback, driving the
//! codec, registry, relay, and transfer engine together exactly as
//! `connection::handle_connection` wires them up in `main.rs` — the
//! binary just adds TLS termination in front of the same entry point.
//!
//! Scenario numbering follows the broker's own protocol walkthrough:
//! 1 (happy-path transfer), 2 (whole-file checksum mismatch), 5
//! (slow-peer/backpressure termination).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use socket2::Socket;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use uuid::Uuid;

use broker_auth::{DefaultAuthProvider, EndpointCredentials, TechnicianCredentials};
use broker_codec::{chunk_checksum, read_frame, write_frame, Frame};
use broker_db::{Database, SqliteAuditSink};
use broker_registry::SessionRegistry;
use broker_server::{connection, state::AppState};
use broker_transfer::{NullLogger, SizeThresholdPolicy, Storage, TransferEngine, TransferPolicy};
use broker_types::wire::{
    AckStatus, ControlBody, ControlClass, FrameBody, PairRequestBody, RegisterBody,
    TransferChunkBody, TransferRequestBody,
};
use broker_types::{BrokerConfig, Direction, SessionId};

struct TestBroker {
    addr: SocketAddr,
    tmp: tempfile::TempDir,
}

fn test_config(t_backpressure: Duration) -> BrokerConfig {
    BrokerConfig {
        bind_host: "127.0.0.1".into(),
        bind_port: 0,
        jwt_secret: "test-secret".into(),
        tls_cert_path: String::new(),
        tls_key_path: String::new(),
        endpoint_pinned_fingerprints: vec![],
        max_sessions_total: 1000,
        max_sessions_per_endpoint: 10,
        max_concurrent_transfers_per_session: 4,
        max_file_size: 10 * 1024 * 1024,
        chunk_size_min: 16,
        chunk_size_max: 1024 * 1024,
        allowed_extensions: None,
        blocked_extensions: vec![],
        t_hb: Duration::from_secs(15),
        t_idle: Duration::from_secs(1800),
        t_stall: Duration::from_secs(60),
        t_backpressure,
        require_approval_upload: true,
        require_approval_download: true,
        auto_approve_below_bytes: u64::MAX,
        db_path: String::new(),
        temp_dir: String::new(),
    }
}

/// Wires up the same modules `main.rs` does, minus TLS (the wire loop and
/// every handler downstream of it is identical) and the periodic
/// heartbeat/stall tickers (not exercised by these scenarios).
async fn spawn_broker(t_backpressure: Duration) -> TestBroker {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(t_backpressure));

    let db = Arc::new(Database::open(&tmp.path().join("broker.sqlite3")).unwrap());
    let auth = Arc::new(DefaultAuthProvider::new(db.clone()));
    auth.provision_technician("tech-1", "alice", "hunter2-hunter2")
        .unwrap();
    let audit = Arc::new(SqliteAuditSink::new(db.clone()));
    let approval = Arc::new(SizeThresholdPolicy {
        auto_approve_below_bytes: config.auto_approve_below_bytes,
    });

    let storage = Storage::new(tmp.path().join("incoming"));
    let policy = TransferPolicy {
        max_file_size: config.max_file_size,
        chunk_size_min: config.chunk_size_min,
        chunk_size_max: config.chunk_size_max,
        allowed_extensions: config.allowed_extensions.clone(),
        blocked_extensions: config.blocked_extensions.clone(),
        max_concurrent_transfers_per_session: config.max_concurrent_transfers_per_session,
        final_dir: tmp.path().join("complete"),
        t_stall: config.t_stall,
    };
    let transfers = Arc::new(TransferEngine::new(policy, storage, Arc::new(NullLogger)));

    let registry = SessionRegistry::new(config.max_sessions_total, config.max_sessions_per_endpoint);
    let app_state = AppState {
        config: config.clone(),
        registry,
        links: Arc::new(DashMap::new()),
        transfers,
        auth,
        audit,
        approval,
        rate_trackers: Arc::new(DashMap::new()),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let state = app_state.clone();
            tokio::spawn(connection::handle_connection(state, socket));
        }
    });

    TestBroker { addr, tmp }
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

/// Connects with an artificially small receive buffer, so the broker's
/// writer for this connection genuinely blocks on the real socket well
/// before any of the relay's own in-process queues could be mistaken for
/// the bottleneck.
async fn connect_with_small_rcvbuf(addr: SocketAddr, rcvbuf: usize) -> TcpStream {
    let std_stream = std::net::TcpStream::connect(addr).unwrap();
    let sock = Socket::from(std_stream);
    let _ = sock.set_recv_buffer_size(rcvbuf);
    sock.set_nonblocking(true).unwrap();
    TcpStream::from_std(sock.into()).unwrap()
}

async fn register_endpoint<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, fingerprint: &str) -> SessionId {
    let creds = serde_json::to_vec(&EndpointCredentials::Adhoc {
        fingerprint: fingerprint.into(),
        code: "anything".into(),
    })
    .unwrap();
    write_frame(
        stream,
        &Frame::new(FrameBody::Register(RegisterBody { endpoint_auth: creds })),
    )
    .await
    .unwrap();
    match read_frame(stream).await.unwrap().unwrap().body {
        FrameBody::RegisterAck(ack) => ack.sid,
        other => panic!("expected register_ack, got {other:?}"),
    }
}

async fn pair_technician<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    sid: &SessionId,
    username: &str,
    password: &str,
) {
    let creds = serde_json::to_vec(&TechnicianCredentials {
        username: username.into(),
        password: password.into(),
    })
    .unwrap();
    write_frame(
        stream,
        &Frame::new(FrameBody::PairRequest(PairRequestBody {
            sid: sid.clone(),
            technician_auth: creds,
        })),
    )
    .await
    .unwrap();
    match read_frame(stream).await.unwrap().unwrap().body {
        FrameBody::PairAck(ack) => assert!(ack.accepted, "pair rejected: {:?}", ack.reason),
        other => panic!("expected pair_ack, got {other:?}"),
    }
}

fn sha256_of(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[tokio::test]
async fn happy_path_transfer_completes_end_to_end() {
    let broker = spawn_broker(Duration::from_secs(5)).await;

    let mut endpoint = connect(broker.addr).await;
    let sid = register_endpoint(&mut endpoint, "laptop-1").await;

    let mut technician = connect(broker.addr).await;
    pair_technician(&mut technician, &sid, "alice", "hunter2-hunter2").await;

    let data = vec![0x42u8; 2048];
    let tid = Uuid::new_v4();

    write_frame(
        &mut technician,
        &Frame::new(FrameBody::TransferRequest(TransferRequestBody {
            tid,
            direction: Direction::Upload,
            filename: "notes.txt".into(),
            declared_size: data.len() as u64,
            declared_checksum: sha256_of(&data),
            chunk_size: 1024,
        })),
    )
    .await
    .unwrap();

    // Below `auto_approve_below_bytes`, so the requester gets its own
    // accept back rather than the opposite party being asked.
    match read_frame(&mut technician).await.unwrap().unwrap().body {
        FrameBody::TransferResponse(resp) => assert!(resp.accept),
        other => panic!("expected transfer_response, got {other:?}"),
    }

    for (seq, chunk) in data.chunks(1024).enumerate() {
        let is_last = (seq + 1) * 1024 >= data.len();
        write_frame(
            &mut technician,
            &Frame::new(FrameBody::TransferChunk(TransferChunkBody {
                tid,
                seq: seq as u32,
                is_last,
                chunk_checksum: chunk_checksum(chunk),
                payload: chunk.to_vec(),
            })),
        )
        .await
        .unwrap();

        match read_frame(&mut technician).await.unwrap().unwrap().body {
            FrameBody::TransferAck(ack) => assert_eq!(ack.status, AckStatus::Ok),
            other => panic!("expected transfer_ack, got {other:?}"),
        }
    }

    // The endpoint sees each chunk pass through, then a final progress
    // frame marking the transfer complete.
    loop {
        match read_frame(&mut endpoint).await.unwrap().unwrap().body {
            FrameBody::TransferChunk(_) => continue,
            FrameBody::TransferProgress(p) => {
                assert_eq!(p.bytes_transferred, data.len() as u64);
                break;
            }
            other => panic!("unexpected frame draining endpoint side: {other:?}"),
        }
    }

    let final_path = broker.tmp.path().join("complete").join(tid.to_string()).join("notes.txt");
    let got = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(got, data);
}

#[tokio::test]
async fn whole_file_checksum_mismatch_fails_the_transfer_end_to_end() {
    let broker = spawn_broker(Duration::from_secs(5)).await;

    let mut endpoint = connect(broker.addr).await;
    let sid = register_endpoint(&mut endpoint, "laptop-1").await;

    let mut technician = connect(broker.addr).await;
    pair_technician(&mut technician, &sid, "alice", "hunter2-hunter2").await;

    let data = vec![0x7au8; 1024];
    let tid = Uuid::new_v4();

    write_frame(
        &mut technician,
        &Frame::new(FrameBody::TransferRequest(TransferRequestBody {
            tid,
            direction: Direction::Upload,
            filename: "bad.bin".into(),
            declared_size: data.len() as u64,
            // Every per-chunk checksum below will be correct; only the
            // whole-file checksum is wrong.
            declared_checksum: [0xFFu8; 32],
            chunk_size: 512,
        })),
    )
    .await
    .unwrap();
    match read_frame(&mut technician).await.unwrap().unwrap().body {
        FrameBody::TransferResponse(resp) => assert!(resp.accept),
        other => panic!("expected transfer_response, got {other:?}"),
    }

    let chunk0 = &data[0..512];
    write_frame(
        &mut technician,
        &Frame::new(FrameBody::TransferChunk(TransferChunkBody {
            tid,
            seq: 0,
            is_last: false,
            chunk_checksum: chunk_checksum(chunk0),
            payload: chunk0.to_vec(),
        })),
    )
    .await
    .unwrap();
    match read_frame(&mut technician).await.unwrap().unwrap().body {
        FrameBody::TransferAck(ack) => assert_eq!(ack.status, AckStatus::Ok),
        other => panic!("expected transfer_ack, got {other:?}"),
    }
    match read_frame(&mut endpoint).await.unwrap().unwrap().body {
        FrameBody::TransferChunk(c) => assert_eq!(c.seq, 0),
        other => panic!("expected transfer_chunk, got {other:?}"),
    }

    let chunk1 = &data[512..1024];
    write_frame(
        &mut technician,
        &Frame::new(FrameBody::TransferChunk(TransferChunkBody {
            tid,
            seq: 1,
            is_last: true,
            chunk_checksum: chunk_checksum(chunk1),
            payload: chunk1.to_vec(),
        })),
    )
    .await
    .unwrap();

    match read_frame(&mut technician).await.unwrap().unwrap().body {
        FrameBody::Error(err) => assert_eq!(err.kind, broker_types::ErrorKind::Integrity),
        other => panic!("expected error, got {other:?}"),
    }
    match read_frame(&mut endpoint).await.unwrap().unwrap().body {
        FrameBody::Error(err) => assert_eq!(err.kind, broker_types::ErrorKind::Integrity),
        other => panic!("expected error, got {other:?}"),
    }

    let temp_path = broker.tmp.path().join("incoming").join(format!("{tid}.part"));
    assert!(!temp_path.exists());
}

#[tokio::test]
async fn slow_peer_backpressure_terminates_the_session() {
    let broker = spawn_broker(Duration::from_millis(150)).await;

    let mut endpoint = connect_with_small_rcvbuf(broker.addr, 2048).await;
    let sid = register_endpoint(&mut endpoint, "laptop-2").await;

    let mut technician = connect(broker.addr).await;
    pair_technician(&mut technician, &sid, "alice", "hunter2-hunter2").await;
    let (mut tech_reader, mut tech_writer) = split(technician);

    // The endpoint never reads again past this point. Flood the reliable
    // control lane; the broker's writer for the endpoint connection
    // eventually blocks on the real, now-tiny-window socket, which backs
    // up the relay queue and then `route_control_frame` itself once
    // `t_backpressure` elapses on a full lane.
    let flood = async {
        for _ in 0..50_000u32 {
            let frame = Frame::new(FrameBody::Control(ControlBody {
                class: ControlClass::Reliable,
                coalesce_key: 0,
                payload: vec![0u8; 32],
            }));
            if write_frame(&mut tech_writer, &frame).await.is_err() {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(8), flood).await;

    // Once the session is torn down as `slow_peer`, the technician's own
    // connection is cancelled and closed from the broker's side too.
    let closed = tokio::time::timeout(Duration::from_secs(8), read_frame(&mut tech_reader)).await;
    match closed {
        Ok(Ok(None)) => {}
        Ok(Err(_)) => {}
        other => panic!("expected the technician connection to close after sustained backpressure, got {other:?}"),
    }
}
