use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use dashmap::DashMap;
use serde_json::json;
use socket2::{Domain, Protocol, Socket, Type};
use tower_http::trace::TraceLayer;
use tracing::info;

use broker_auth::DefaultAuthProvider;
use broker_db::{Database, SqliteAuditSink};
use broker_registry::SessionRegistry;
use broker_server::{connection, state, tls};
use broker_transfer::{SizeThresholdPolicy, Storage, TransferEngine, TransferPolicy};
use broker_types::BrokerConfig;

use state::AppState;

/// Idle session sweep cadence. Independent of `t_idle` itself, which is
/// the threshold a session must exceed before `reap_idle` closes it.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Stalled-transfer sweep cadence. Independent of `t_stall` itself, which
/// is the threshold a transfer must exceed before it is failed.
const STALL_REAP_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "broker=debug,tower_http=debug".into()),
        )
        .init();

    let config = Arc::new(BrokerConfig::from_env()?);

    let db = Arc::new(Database::open(std::path::Path::new(&config.db_path))?);
    let auth = Arc::new(DefaultAuthProvider::new(db.clone()));
    let audit = Arc::new(SqliteAuditSink::new(db.clone()));
    let approval = Arc::new(SizeThresholdPolicy {
        auto_approve_below_bytes: config.auto_approve_below_bytes,
    });

    let storage = Storage::new(config.temp_dir.clone());
    let policy = TransferPolicy {
        max_file_size: config.max_file_size,
        chunk_size_min: config.chunk_size_min,
        chunk_size_max: config.chunk_size_max,
        allowed_extensions: config.allowed_extensions.clone(),
        blocked_extensions: config.blocked_extensions.clone(),
        max_concurrent_transfers_per_session: config.max_concurrent_transfers_per_session,
        final_dir: std::path::PathBuf::from(&config.temp_dir).join("complete"),
        t_stall: config.t_stall,
    };
    let transfers = Arc::new(TransferEngine::new(
        policy,
        storage,
        Arc::new(broker_transfer::TracingLogger),
    ));

    let registry = SessionRegistry::new(config.max_sessions_total, config.max_sessions_per_endpoint);

    let app_state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        links: Arc::new(DashMap::new()),
        transfers,
        auth,
        audit,
        approval,
        rate_trackers: Arc::new(DashMap::new()),
    };

    let acceptor = tls::build_acceptor(&config)?;

    let addr: SocketAddr = format!("{}:{}", config.bind_host, config.bind_port).parse()?;
    let listener = bind_listener(addr)?;
    info!(%addr, "broker listening");

    {
        let registry = registry.clone();
        let t_idle = config.t_idle;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                registry.reap_idle(t_idle).await;
            }
        });
    }

    {
        let state = app_state.clone();
        let t_hb = config.t_hb;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(t_hb);
            loop {
                ticker.tick().await;
                connection::reap_stale_heartbeats(&state, t_hb).await;
            }
        });
    }

    {
        let state = app_state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALL_REAP_INTERVAL);
            loop {
                ticker.tick().await;
                connection::reap_stalled_transfers(&state).await;
            }
        });
    }

    let admin_port: u16 = std::env::var("BROKER_ADMIN_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.bind_port + 1);
    {
        let registry = registry.clone();
        let admin_addr: SocketAddr = format!("{}:{}", config.bind_host, admin_port).parse()?;
        let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;
        info!(addr = %admin_addr, "admin/health endpoint listening");
        let app = admin_router(registry);
        tokio::spawn(async move {
            let _ = axum::serve(admin_listener, app).await;
        });
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let state = app_state.clone();
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(tls_stream) => connection::handle_connection(state, tls_stream).await,
                        Err(e) => tracing::warn!(%peer, error = %e, "TLS handshake failed"),
                    }
                });
            }
            _ = shutdown_signal() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn bind_listener(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(socket.into())?)
}

fn admin_router(registry: SessionRegistry) -> Router {
    Router::new()
        .route(
            "/healthz",
            get(move || {
                let registry = registry.clone();
                async move {
                    Json(json!({
                        "status": "ok",
                        "active_sessions": registry.active_session_count(),
                    }))
                }
            }),
        )
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received ctrl-c");
    }
}
