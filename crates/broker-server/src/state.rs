//! Shared broker context, built once in `main` and handed to every
//! connection task. Grounded in the teacher's `haven-gateway::Dispatcher`
//! (a single shared map plus a handful of shared services) generalized
//! into the handful of maps/services a paired session needs: one for
//! registry bookkeeping, one for relay queues, one for the raw per-role
//! write channel used to deliver non-`control` frames directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use broker_auth::AuthProvider;
use broker_codec::Frame;
use broker_registry::SessionRegistry;
use broker_relay::RelayPair;
use broker_types::{AuditSink, BrokerConfig, SessionId};

use broker_transfer::{ApprovalPolicy, TransferEngine};

/// Bounded so a connection that stops reading eventually backpressures
/// the broker's own forwarding tasks rather than growing without bound.
pub const CONN_OUTBOX_CAPACITY: usize = 256;

/// The write side of a connection's outbox plus per-connection liveness,
/// used by the heartbeat watchdog to detect a peer that stopped
/// responding independently of the registry's coarser idle timeout.
pub struct ConnLink {
    pub tx: mpsc::Sender<Frame>,
    /// The authenticated endpoint fingerprint or technician username this
    /// link belongs to, used as `actor` on audit records raised from code
    /// that only has the `ConnLink`, not the originating frame, in hand.
    pub identity: String,
    last_seen_unix_ms: AtomicI64,
}

impl ConnLink {
    pub fn new(tx: mpsc::Sender<Frame>, identity: String) -> Self {
        Self {
            tx,
            identity,
            last_seen_unix_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn touch(&self) {
        self.last_seen_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> std::time::Duration {
        let last = self.last_seen_unix_ms.load(Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();
        std::time::Duration::from_millis((now - last).max(0) as u64)
    }
}

/// Rolling `(instant, bytes_transferred)` sample window behind each active
/// transfer's `transfer_progress` emission, per §2a. Keeps only enough
/// history to compute a short-horizon rate rather than an all-time
/// average, so a paused-then-resumed transfer's speed reading recovers
/// quickly instead of staying dragged down by the pause.
pub struct RateTracker {
    samples: VecDeque<(Instant, u64)>,
}

/// How long a sample stays in the window before aging out.
const RATE_WINDOW: std::time::Duration = std::time::Duration::from_secs(10);

impl RateTracker {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(ts, _)) = self.samples.front() {
            if now.duration_since(ts) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records a new `bytes_transferred` reading and returns
    /// `(speed_bps, eta_secs)` computed over the current window.
    pub fn sample(&mut self, bytes_transferred: u64, declared_size: u64) -> (u64, Option<u64>) {
        let now = Instant::now();
        self.samples.push_back((now, bytes_transferred));
        self.prune(now);

        let Some(&(oldest_ts, oldest_bytes)) = self.samples.front() else {
            return (0, None);
        };
        let elapsed = now.duration_since(oldest_ts).as_secs_f64();
        if elapsed <= 0.0 || bytes_transferred <= oldest_bytes {
            return (0, None);
        }
        let speed_bps = ((bytes_transferred - oldest_bytes) as f64 / elapsed) as u64;
        let remaining = declared_size.saturating_sub(bytes_transferred);
        let eta_secs = if speed_bps > 0 {
            Some(remaining / speed_bps)
        } else {
            None
        };
        (speed_bps, eta_secs)
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The two connection links a paired session owns, plus the relay
/// queues shuttling `control` frames between them. The endpoint link
/// exists from `register` onward; the technician link attaches at
/// `pair`.
pub struct SessionLink {
    pub relay: Arc<RelayPair>,
    pub endpoint: Arc<ConnLink>,
    pub technician: RwLock<Option<Arc<ConnLink>>>,
}

impl SessionLink {
    pub fn new(endpoint: Arc<ConnLink>) -> Self {
        Self {
            relay: Arc::new(RelayPair::new()),
            endpoint,
            technician: RwLock::new(None),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub registry: SessionRegistry,
    pub links: Arc<DashMap<SessionId, Arc<SessionLink>>>,
    pub transfers: Arc<TransferEngine>,
    pub auth: Arc<dyn AuthProvider>,
    pub audit: Arc<dyn AuditSink>,
    pub approval: Arc<dyn ApprovalPolicy>,
    pub rate_trackers: Arc<DashMap<Uuid, Mutex<RateTracker>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn no_samples_yet_reports_no_rate() {
        let mut tracker = RateTracker::new();
        let (speed, eta) = tracker.sample(0, 1000);
        assert_eq!(speed, 0);
        assert_eq!(eta, None);
    }

    #[test]
    fn rising_byte_count_yields_a_positive_speed_and_eta() {
        let mut tracker = RateTracker::new();
        tracker.sample(0, 1_000_000);
        sleep(Duration::from_millis(50));
        let (speed, eta) = tracker.sample(500_000, 1_000_000);
        assert!(speed > 0);
        assert!(eta.is_some());
    }

    #[test]
    fn stale_samples_age_out_of_the_window() {
        let mut tracker = RateTracker::new();
        tracker.samples.push_back((Instant::now() - RATE_WINDOW - Duration::from_secs(1), 0));
        tracker.prune(Instant::now());
        assert!(tracker.samples.is_empty());
    }
}
