//! A single direction's outbound `control`-frame queue, split into a
//! never-drop reliable lane and a drop-older/coalescing real-time lane.
//!
//! Grounded in this codebase's TCP relay, whose per-user channel used
//! `try_send` + drop-on-full for every frame alike; the broker splits
//! that single policy into two, per §4.3, because input events must
//! never be silently dropped the way a screen delta safely can be.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use broker_types::wire::ControlBody;

use crate::error::RelayError;

/// Real-time queue depth above which a newly pushed frame coalesces with
/// (replaces) an existing same-key entry instead of growing the queue.
pub const H_COALESCE: usize = 8;

/// Bound on the reliable lane. Chosen generously since reliable frames
/// are input events/acks, not bulk data; filling it is itself the signal
/// that the peer has stopped reading.
const RELIABLE_CAPACITY: usize = 512;

struct RealtimeLane {
    queue: Mutex<VecDeque<ControlBody>>,
    notify: Notify,
    depth: AtomicUsize,
}

pub struct ControlQueue {
    reliable_tx: mpsc::Sender<ControlBody>,
    reliable_rx: Mutex<mpsc::Receiver<ControlBody>>,
    realtime: RealtimeLane,
}

impl ControlQueue {
    pub fn new() -> Self {
        let (reliable_tx, reliable_rx) = mpsc::channel(RELIABLE_CAPACITY);
        Self {
            reliable_tx,
            reliable_rx: Mutex::new(reliable_rx),
            realtime: RealtimeLane {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                depth: AtomicUsize::new(0),
            },
        }
    }

    /// Enqueues a reliable frame, preserving producer order. Blocks (and
    /// thus backpressures the caller's read loop) if the lane is full; if
    /// that persists past `t_backpressure`, returns
    /// [`RelayError::SlowPeer`] so the caller can terminate the session.
    pub async fn send_reliable(
        &self,
        frame: ControlBody,
        t_backpressure: Duration,
    ) -> Result<(), RelayError> {
        tokio::time::timeout(t_backpressure, self.reliable_tx.send(frame))
            .await
            .map_err(|_| RelayError::SlowPeer)?
            .map_err(|_| RelayError::SlowPeer)
    }

    /// Enqueues a real-time frame. Never blocks: once depth exceeds
    /// `H_COALESCE`, a prior entry sharing `coalesce_key` is replaced; if
    /// none shares the key, the oldest entry is dropped to make room.
    pub async fn push_realtime(&self, frame: ControlBody) {
        let mut queue = self.realtime.queue.lock().await;
        if queue.len() >= H_COALESCE {
            if let Some(pos) = queue
                .iter()
                .position(|f| f.coalesce_key == frame.coalesce_key)
            {
                queue.remove(pos);
            } else {
                queue.pop_front();
            }
        }
        queue.push_back(frame);
        self.realtime.depth.store(queue.len(), Ordering::Relaxed);
        drop(queue);
        self.realtime.notify.notify_one();
    }

    pub fn realtime_depth(&self) -> usize {
        self.realtime.depth.load(Ordering::Relaxed)
    }

    /// Pulls the next frame to write out, preferring the reliable lane so
    /// its producer order is preserved; real-time frames are interleaved
    /// whenever the reliable lane is momentarily empty.
    pub async fn recv(&self) -> Option<ControlBody> {
        loop {
            {
                let mut rx = self.reliable_rx.lock().await;
                if let Ok(frame) = rx.try_recv() {
                    return Some(frame);
                }
            }
            {
                let mut queue = self.realtime.queue.lock().await;
                if let Some(frame) = queue.pop_front() {
                    self.realtime.depth.store(queue.len(), Ordering::Relaxed);
                    return Some(frame);
                }
            }

            let notified = self.realtime.notify.notified();
            let mut rx = self.reliable_rx.lock().await;
            tokio::select! {
                frame = rx.recv() => return frame,
                _ = notified => continue,
            }
        }
    }
}

impl Default for ControlQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_types::wire::ControlClass;

    fn frame(key: u32, byte: u8) -> ControlBody {
        ControlBody {
            class: ControlClass::RealTime,
            coalesce_key: key,
            payload: vec![byte],
        }
    }

    #[tokio::test]
    async fn reliable_frames_preserve_order() {
        let q = ControlQueue::new();
        for i in 0..5u8 {
            q.send_reliable(
                ControlBody {
                    class: ControlClass::Reliable,
                    coalesce_key: 0,
                    payload: vec![i],
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        }
        for i in 0..5u8 {
            let got = q.recv().await.unwrap();
            assert_eq!(got.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn realtime_coalesces_same_key_above_threshold() {
        let q = ControlQueue::new();
        for depth in 0..H_COALESCE + 3 {
            q.push_realtime(frame(7, depth as u8)).await;
        }
        // The key-7 slot should hold only the most recent push, so total
        // depth never grows past H_COALESCE once coalescing kicks in.
        assert!(q.realtime_depth() <= H_COALESCE + 1);
        let mut last_seven = None;
        while let Ok(Some(f)) = tokio::time::timeout(Duration::from_millis(10), q.recv()).await {
            if f.coalesce_key == 7 {
                last_seven = Some(f.payload[0]);
            }
        }
        assert_eq!(last_seven, Some((H_COALESCE + 2) as u8));
    }

    #[tokio::test]
    async fn reliable_lane_backpressures_when_full() {
        let q = Arc::new(ControlQueue::new());
        for i in 0..RELIABLE_CAPACITY as u8 {
            q.send_reliable(
                ControlBody {
                    class: ControlClass::Reliable,
                    coalesce_key: 0,
                    payload: vec![i],
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        }
        let err = q
            .send_reliable(
                ControlBody {
                    class: ControlClass::Reliable,
                    coalesce_key: 0,
                    payload: vec![0xFF],
                },
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SlowPeer));
    }
}
