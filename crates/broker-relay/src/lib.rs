//! Relay core (C3): two independent forwarding loops per paired session,
//! carrying `control` frames only, with per-direction bounded queues and
//! backpressure/coalescing per §4.3.

pub mod error;
pub mod queue;

pub use error::RelayError;
pub use queue::{ControlQueue, H_COALESCE};

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tracing::warn;

use broker_codec::{write_frame, Frame};
use broker_registry::CancellationToken;
use broker_types::wire::{ControlBody, FrameBody};

/// The two queues for a paired session: frames routed `to_endpoint` are
/// written out on the endpoint connection, and vice versa.
pub struct RelayPair {
    pub to_endpoint: ControlQueue,
    pub to_technician: ControlQueue,
}

impl RelayPair {
    pub fn new() -> Self {
        Self {
            to_endpoint: ControlQueue::new(),
            to_technician: ControlQueue::new(),
        }
    }
}

impl Default for RelayPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes one received `control` frame onto the given outbound queue,
/// applying the reliable-vs-real-time policy. Called from each
/// connection's reader loop with the *other* side's queue.
pub async fn route_control_frame(
    out: &ControlQueue,
    body: ControlBody,
    t_backpressure: Duration,
) -> Result<(), RelayError> {
    use broker_types::wire::ControlClass;
    match body.class {
        ControlClass::Reliable => out.send_reliable(body, t_backpressure).await,
        ControlClass::RealTime => {
            out.push_realtime(body).await;
            Ok(())
        }
    }
}

/// Drains `queue` and writes each frame to `writer` until the
/// cancellation token fires. Runs as one direction's writer task; the
/// other direction runs its own independent instance of this loop.
pub async fn run_writer_loop<W: AsyncWrite + Unpin>(
    queue: Arc<ControlQueue>,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            maybe_frame = queue.recv() => {
                let Some(body) = maybe_frame else { return Ok(()) };
                let frame = Frame::new(FrameBody::Control(body));
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(error = %e, "relay writer failed, closing loop");
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_types::wire::ControlClass;

    #[tokio::test]
    async fn writer_loop_drains_queue_until_cancelled() {
        let queue = Arc::new(ControlQueue::new());
        queue
            .send_reliable(
                ControlBody {
                    class: ControlClass::Reliable,
                    coalesce_key: 0,
                    payload: vec![1, 2, 3],
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (mut client, mut server) = tokio::io::duplex(4096);
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            run_writer_loop(queue, &mut server, cancel_clone).await
        });

        let got = broker_codec::read_frame(&mut client).await.unwrap().unwrap();
        match got.body {
            FrameBody::Control(body) => assert_eq!(body.payload, vec![1, 2, 3]),
            other => panic!("unexpected: {other:?}"),
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
