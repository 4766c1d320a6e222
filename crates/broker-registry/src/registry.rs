//! The session registry: a concurrent map keyed by `sid`, fine-grained
//! per-session locking via `DashMap`'s internal sharding plus a lock
//! around each session's mutable fields — so two sessions never contend
//! on a shared lock. Grounded in this codebase's `Dispatcher` (online
//! user / per-connection ownership tracking) and `RelaySession`
//! (implicit two-sided pairing on first/second connect), generalized from
//! an in-process chat gateway and a UDP data-plane relay into the
//! broker's authoritative session store.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use broker_types::session::{Session, SessionState};
use broker_types::sid::SessionId;

use crate::cancel::CancellationToken;
use crate::error::RegistryError;

const MAX_ID_ATTEMPTS: u32 = 16;

/// A live session plus the registry-owned bookkeeping around it.
pub struct RegisteredSession {
    pub sid: SessionId,
    state: RwLock<Session>,
    /// Monotonic counter incremented each time a connection attaches to a
    /// role slot; lets a worker detect that a newer connection has taken
    /// its place and it should stop acting, mirroring the `conn_id` guard
    /// in this codebase's gateway dispatcher.
    endpoint_generation: AtomicUsize,
    technician_generation: AtomicUsize,
    pub transfer_count: AtomicUsize,
    last_activity_unix_ms: AtomicI64,
    pub cancel: CancellationToken,
}

impl RegisteredSession {
    pub async fn snapshot(&self) -> Session {
        self.state.read().await.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.state
    }

    pub fn touch(&self) {
        self.last_activity_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_unix_ms.load(Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();
        Duration::from_millis((now - last).max(0) as u64)
    }

    /// Registers a new endpoint connection attempt, bumping the
    /// generation counter. Callers hold on to the returned generation and
    /// compare it before acting on behalf of this connection later.
    pub fn attach_endpoint(&self) -> usize {
        self.endpoint_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn attach_technician(&self) -> usize {
        self.technician_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current_technician(&self, generation: usize) -> bool {
        self.technician_generation.load(Ordering::SeqCst) == generation
    }

    pub fn is_current_endpoint(&self, generation: usize) -> bool {
        self.endpoint_generation.load(Ordering::SeqCst) == generation
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<RegisteredSession>>>,
    endpoint_session_counts: Arc<DashMap<String, usize>>,
    max_sessions_total: usize,
    max_sessions_per_endpoint: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions_total: usize, max_sessions_per_endpoint: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            endpoint_session_counts: Arc::new(DashMap::new()),
            max_sessions_total,
            max_sessions_per_endpoint,
        }
    }

    /// Creates a new session for a freshly authenticated endpoint,
    /// regenerating the `sid` on collision (expected probability is
    /// astronomically small; the loop bound exists only to turn a
    /// hypothetical RNG defect into an error instead of a hang).
    pub fn register(
        &self,
        endpoint_fingerprint: String,
    ) -> Result<Arc<RegisteredSession>, RegistryError> {
        if self.sessions.len() >= self.max_sessions_total {
            return Err(RegistryError::GlobalCapReached);
        }

        let mut per_endpoint = self
            .endpoint_session_counts
            .entry(endpoint_fingerprint.clone())
            .or_insert(0);
        if *per_endpoint >= self.max_sessions_per_endpoint {
            return Err(RegistryError::EndpointCapReached);
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let sid = SessionId::generate();
            if self.sessions.contains_key(&sid) {
                continue;
            }
            let session = Session::new(sid.clone(), endpoint_fingerprint.clone());
            let registered = Arc::new(RegisteredSession {
                sid: sid.clone(),
                state: RwLock::new(session),
                endpoint_generation: AtomicUsize::new(1),
                technician_generation: AtomicUsize::new(0),
                transfer_count: AtomicUsize::new(0),
                last_activity_unix_ms: AtomicI64::new(Utc::now().timestamp_millis()),
                cancel: CancellationToken::new(),
            });
            self.sessions.insert(sid.clone(), registered.clone());
            *per_endpoint += 1;
            info!(sid = %sid, "session registered");
            return Ok(registered);
        }

        Err(RegistryError::IdAllocationFailed(MAX_ID_ATTEMPTS))
    }

    pub fn lookup(&self, sid: &SessionId) -> Option<Arc<RegisteredSession>> {
        self.sessions.get(sid).map(|e| e.clone())
    }

    /// Pairs a technician into an `awaiting_pair` session. A second
    /// `pair_request` against an already-paired or closed `sid` is
    /// rejected — pairing is one-shot per session (§8 pairing uniqueness).
    pub async fn pair(
        &self,
        sid: &SessionId,
        technician_identity: String,
    ) -> Result<Arc<RegisteredSession>, RegistryError> {
        let session = self
            .sessions
            .get(sid)
            .map(|e| e.clone())
            .ok_or_else(|| RegistryError::NotFound(sid.clone()))?;

        let mut guard = session.state.write().await;
        if guard.state != SessionState::AwaitingPair {
            return Err(RegistryError::NotAwaitingPair(sid.clone()));
        }
        guard.state = SessionState::Active;
        guard.technician_identity = Some(technician_identity);
        drop(guard);
        session.touch();
        info!(sid = %sid, "session paired");
        Ok(session.clone())
    }

    /// Idempotent. Moves the session through `terminating` to `closed`
    /// and removes it from the live map. Callers are responsible for
    /// cancelling owned transfers and connections before/while this runs;
    /// the cancellation token is signalled here so they observe it.
    pub async fn terminate(&self, sid: &SessionId, reason: &str) {
        let Some(session) = self.sessions.get(sid).map(|e| e.clone()) else {
            return;
        };

        {
            let mut guard = session.state.write().await;
            if guard.state == SessionState::Closed {
                return;
            }
            guard.state = SessionState::Terminating;
        }

        session.cancel.cancel();
        warn!(sid = %sid, reason, "session terminating");

        {
            let mut guard = session.state.write().await;
            guard.state = SessionState::Closed;
        }

        if let Some(mut count) = self
            .endpoint_session_counts
            .get_mut(&session.snapshot().await.endpoint_fingerprint)
        {
            *count = count.saturating_sub(1);
        }

        self.sessions.remove(sid);
        info!(sid = %sid, "session closed");
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sweeps sessions idle for longer than `t_idle`, terminating each
    /// with `reason=idle`. Intended to be driven by a periodic
    /// `tokio::time::interval` loop in `broker-server`.
    pub async fn reap_idle(&self, t_idle: Duration) {
        let idle_sids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() >= t_idle)
            .map(|e| e.key().clone())
            .collect();

        for sid in idle_sids {
            self.terminate(&sid, "idle").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_pair_transitions_to_active() {
        let registry = SessionRegistry::new(10, 10);
        let session = registry.register("endpoint-1".into()).unwrap();
        assert_eq!(session.state().await, SessionState::AwaitingPair);

        let paired = registry.pair(&session.sid, "tech-1".into()).await.unwrap();
        assert_eq!(paired.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn second_pair_request_on_active_session_is_rejected() {
        let registry = SessionRegistry::new(10, 10);
        let session = registry.register("endpoint-1".into()).unwrap();
        registry.pair(&session.sid, "tech-1".into()).await.unwrap();

        let err = registry.pair(&session.sid, "tech-2".into()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotAwaitingPair(_)));
    }

    #[tokio::test]
    async fn pair_on_unknown_sid_fails() {
        let registry = SessionRegistry::new(10, 10);
        let bogus = SessionId::parse("ABCDEFGHJ").unwrap();
        let err = registry.pair(&bogus, "tech-1".into()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn per_endpoint_cap_is_enforced() {
        let registry = SessionRegistry::new(100, 1);
        registry.register("endpoint-1".into()).unwrap();
        let err = registry.register("endpoint-1".into()).unwrap_err();
        assert!(matches!(err, RegistryError::EndpointCapReached));
    }

    #[tokio::test]
    async fn global_cap_is_enforced() {
        let registry = SessionRegistry::new(1, 10);
        registry.register("endpoint-1".into()).unwrap();
        let err = registry.register("endpoint-2".into()).unwrap_err();
        assert!(matches!(err, RegistryError::GlobalCapReached));
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_removes_the_session() {
        let registry = SessionRegistry::new(10, 10);
        let session = registry.register("endpoint-1".into()).unwrap();
        let sid = session.sid.clone();

        registry.terminate(&sid, "test").await;
        registry.terminate(&sid, "test").await;

        assert!(registry.lookup(&sid).is_none());
    }

    #[tokio::test]
    async fn terminate_cancels_the_session_token() {
        let registry = SessionRegistry::new(10, 10);
        let session = registry.register("endpoint-1".into()).unwrap();
        let token = session.cancel.clone();
        registry.terminate(&session.sid, "test").await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn endpoint_slot_freed_after_terminate_allows_new_registration() {
        let registry = SessionRegistry::new(10, 1);
        let session = registry.register("endpoint-1".into()).unwrap();
        registry.terminate(&session.sid, "test").await;
        assert!(registry.register("endpoint-1".into()).is_ok());
    }
}
