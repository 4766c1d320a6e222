//! Transfer engine (C4): lifecycle, streaming, flow control, and
//! concurrency caps for every active transfer. Grounded on this
//! codebase's file-server chunk-validation/idempotent-upload/completion
//! logic, restructured from an HTTP PUT-per-chunk handler into a
//! socket-framed receiver-assembler worker driven by `transfer_chunk`
//! frames, and on the fast-transfer bitfield/window primitives for
//! in-flight tracking.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::fs::File;
use tokio::sync::Mutex;
use uuid::Uuid;

use broker_types::sid::SessionId;
use broker_types::transfer::{Direction, TerminalReason, Transfer, TransferState};
use broker_types::wire::{AckStatus, TransferRequestBody};

use crate::bitfield::ChunkBitfield;
use crate::error::TransferError;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::storage::Storage;
use crate::window::SlidingWindow;

/// Validated, policy-relevant bounds the engine enforces at
/// `transfer_request` time. Filled in from `BrokerConfig`.
#[derive(Clone)]
pub struct TransferPolicy {
    pub max_file_size: u64,
    pub chunk_size_min: u32,
    pub chunk_size_max: u32,
    pub allowed_extensions: Option<Vec<String>>,
    pub blocked_extensions: Vec<String>,
    pub max_concurrent_transfers_per_session: usize,
    pub final_dir: PathBuf,
    /// §4.4 item 7: no chunk or ack progress within this long while
    /// `in_progress` fails the transfer with `reason=stall`.
    pub t_stall: Duration,
}

impl TransferPolicy {
    fn validate(&self, req: &TransferRequestBody) -> Result<(), TransferError> {
        let filename = req.filename.as_str();
        if req.declared_size > self.max_file_size {
            return Err(TransferError::FileTooLarge(req.declared_size));
        }
        if req.chunk_size < self.chunk_size_min || req.chunk_size > self.chunk_size_max {
            return Err(TransferError::ChunkSizeOutOfRange(req.chunk_size));
        }
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return Err(TransferError::UnsafeFilename(filename.to_string()));
        }
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| e.to_lowercase())
            .unwrap_or_default();
        if self.blocked_extensions.iter().any(|b| b == &ext) {
            return Err(TransferError::ExtensionNotAllowed(ext));
        }
        if let Some(allowed) = &self.allowed_extensions {
            if !allowed.iter().any(|a| a == &ext) {
                return Err(TransferError::ExtensionNotAllowed(ext));
            }
        }
        Ok(())
    }
}

pub struct TransferHandle {
    pub transfer: Transfer,
    bitmap: ChunkBitfield,
    window: SlidingWindow,
    file: Option<File>,
    storage: Storage,
    final_path: PathBuf,
    logger: Arc<dyn TransferLogger>,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Acked { status: AckStatus },
    Completed { final_path: PathBuf },
    ChecksumMismatch,
}

impl TransferHandle {
    pub fn window_size(&self) -> u32 {
        self.window.size()
    }

    /// Validates, writes, tracks, and (on the final chunk) finalizes.
    /// Corrupt chunks ack `status=corrupt` without advancing the bitmap
    /// or window's forward progress; the sender is expected to retransmit.
    pub async fn on_chunk(
        &mut self,
        seq: u32,
        is_last: bool,
        checksum: [u8; 32],
        payload: &[u8],
    ) -> Result<ChunkOutcome, TransferError> {
        if self.transfer.state != TransferState::InProgress {
            return Err(TransferError::InvalidTransition {
                from: self.transfer.state,
                to: TransferState::InProgress,
            });
        }

        self.log(TransferEvent::ChunkReceived { seq, size: payload.len() });

        let file = self.file.as_mut().expect("file opened at approval time");
        let ok = self
            .storage
            .write_chunk(file, seq, self.transfer.chunk_size, payload, checksum)
            .await?;

        if !ok {
            self.window.on_corrupt_ack();
            self.log(TransferEvent::ChunkCorrupt { seq });
            return Ok(ChunkOutcome::ChecksumMismatch);
        }

        if self.bitmap.set(seq) {
            self.transfer.bytes_transferred += payload.len() as u64;
        }
        let window_before = self.window.size();
        self.window.on_ok_ack();
        let window_after = self.window.size();
        if window_after != window_before {
            self.log(TransferEvent::WindowAdjusted {
                old_window: window_before,
                new_window: window_after,
            });
        }
        self.transfer.last_progress_at = Utc::now();
        self.log(TransferEvent::ChunkAcked { seq });

        if is_last && self.bitmap.is_complete() {
            let hash = self.storage.verify_full_hash(file).await?;
            if hash != self.transfer.declared_checksum {
                self.transfer.state = TransferState::Failed;
                self.transfer.terminal_reason = Some(TerminalReason::ChecksumMismatch);
                self.storage.delete_temp(self.transfer.tid).await;
                self.log(TransferEvent::Failed {
                    reason: "checksum_mismatch".into(),
                });
                return Ok(ChunkOutcome::ChecksumMismatch);
            }
            self.storage
                .finalize(self.transfer.tid, &self.final_path)
                .await?;
            self.transfer.state = TransferState::Completed;
            let duration_ms = (Utc::now() - self.transfer.created_at)
                .num_milliseconds()
                .max(0) as u64;
            self.log(TransferEvent::Completed {
                total_bytes: self.transfer.bytes_transferred,
                duration_ms,
            });
            return Ok(ChunkOutcome::Completed {
                final_path: self.final_path.clone(),
            });
        }

        Ok(ChunkOutcome::Acked {
            status: AckStatus::Ok,
        })
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "transfer_engine",
            tid: self.transfer.tid,
            event,
        });
    }

    pub fn pause(&mut self) -> Result<(), TransferError> {
        self.transition(TransferState::Paused)?;
        self.log(TransferEvent::Paused);
        Ok(())
    }

    /// Resume restarts at the lowest unacked seq; the window resets
    /// rather than continuing to grow off pre-pause history.
    pub fn resume(&mut self) -> Result<u32, TransferError> {
        self.transition(TransferState::InProgress)?;
        self.window.reset();
        let restart_seq = self.bitmap.lowest_unacked();
        self.log(TransferEvent::Resumed { restart_seq });
        Ok(restart_seq)
    }

    pub async fn cancel(&mut self) -> Result<(), TransferError> {
        self.transition(TransferState::Cancelled)?;
        self.transfer.terminal_reason = Some(TerminalReason::Cancelled);
        self.storage.delete_temp(self.transfer.tid).await;
        self.log(TransferEvent::Cancelled);
        Ok(())
    }

    pub async fn fail(&mut self, reason: TerminalReason) -> Result<(), TransferError> {
        self.transition(TransferState::Failed)?;
        self.transfer.terminal_reason = Some(reason);
        self.storage.delete_temp(self.transfer.tid).await;
        self.log(TransferEvent::Failed {
            reason: format!("{reason:?}"),
        });
        Ok(())
    }

    pub fn is_stalled(&self, t_stall: Duration) -> bool {
        self.transfer.state == TransferState::InProgress
            && Utc::now().signed_duration_since(self.transfer.last_progress_at)
                >= chrono::Duration::from_std(t_stall).unwrap_or(chrono::Duration::zero())
    }

    fn transition(&mut self, next: TransferState) -> Result<(), TransferError> {
        if !self.transfer.state.can_transition_to(next) {
            return Err(TransferError::InvalidTransition {
                from: self.transfer.state,
                to: next,
            });
        }
        self.transfer.state = next;
        Ok(())
    }
}

struct SessionSlot {
    count: AtomicUsize,
    transfers: DashMap<Uuid, Arc<Mutex<TransferHandle>>>,
}

/// Owns every active transfer across every session, enforcing
/// per-session and global concurrency caps strictly (requests beyond the
/// cap are rejected, never queued).
pub struct TransferEngine {
    policy: TransferPolicy,
    storage: Storage,
    sessions: DashMap<SessionId, SessionSlot>,
    logger: Arc<dyn TransferLogger>,
}

impl TransferEngine {
    pub fn new(policy: TransferPolicy, storage: Storage, logger: Arc<dyn TransferLogger>) -> Self {
        Self {
            policy,
            storage,
            sessions: DashMap::new(),
            logger,
        }
    }

    pub async fn initiate(
        &self,
        sid: &SessionId,
        req: TransferRequestBody,
        direction: Direction,
        initiator_identity: String,
    ) -> Result<Arc<Mutex<TransferHandle>>, TransferError> {
        self.policy.validate(&req)?;

        let slot = self
            .sessions
            .entry(sid.clone())
            .or_insert_with(|| SessionSlot {
                count: AtomicUsize::new(0),
                transfers: DashMap::new(),
            });

        if slot.count.load(Ordering::SeqCst) >= self.policy.max_concurrent_transfers_per_session {
            return Err(TransferError::CapacityReached);
        }
        slot.count.fetch_add(1, Ordering::SeqCst);

        let transfer = Transfer {
            tid: req.tid,
            sid: sid.clone(),
            direction,
            filename: req.filename.clone(),
            declared_size: req.declared_size,
            declared_checksum: req.declared_checksum,
            chunk_size: req.chunk_size,
            state: TransferState::Pending,
            bytes_transferred: 0,
            initiator_identity,
            created_at: Utc::now(),
            approved_at: None,
            last_progress_at: Utc::now(),
            terminal_reason: None,
        };

        let final_path = self.policy.final_dir.join(req.tid.to_string()).join(&req.filename);
        let handle = Arc::new(Mutex::new(TransferHandle {
            transfer,
            bitmap: ChunkBitfield::new(0),
            window: SlidingWindow::new(),
            file: None,
            storage: self.storage.clone(),
            final_path,
            logger: self.logger.clone(),
        }));
        slot.transfers.insert(req.tid, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, sid: &SessionId, tid: Uuid) -> Option<Arc<Mutex<TransferHandle>>> {
        self.sessions
            .get(sid)
            .and_then(|slot| slot.transfers.get(&tid).map(|e| e.value().clone()))
    }

    /// Approves and opens the backing temp file, entering `in_progress`.
    pub async fn approve(
        &self,
        handle: &Arc<Mutex<TransferHandle>>,
        accept: bool,
    ) -> Result<(), TransferError> {
        let mut guard = handle.lock().await;
        if !accept {
            guard.transition(TransferState::Rejected)?;
            return Ok(());
        }
        guard.transition(TransferState::Approved)?;
        guard.transfer.approved_at = Some(Utc::now());
        let chunk_count = guard.transfer.chunk_count();
        guard.bitmap = ChunkBitfield::new(chunk_count);
        let file = guard
            .storage
            .open_temp(guard.transfer.tid, guard.transfer.declared_size)
            .await?;
        guard.file = Some(file);
        guard.transition(TransferState::InProgress)?;
        Ok(())
    }

    /// Removes a terminal transfer from the active set and frees its
    /// concurrency slot. Callers do this once they've finished reacting
    /// to the terminal outcome (emitting the audit record, final
    /// progress frame, etc).
    pub fn retire(&self, sid: &SessionId, tid: Uuid) {
        if let Some(slot) = self.sessions.get(sid) {
            if slot.transfers.remove(&tid).is_some() {
                slot.count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    pub fn active_transfers(&self, sid: &SessionId) -> Vec<Uuid> {
        self.sessions
            .get(sid)
            .map(|slot| slot.transfers.iter().map(|e| *e.key()).collect())
            .unwrap_or_default()
    }

    /// Drops every transfer owned by a session, marking each non-terminal
    /// one cancelled. Called when a session terminates.
    pub async fn cancel_all(&self, sid: &SessionId) -> HashMap<Uuid, Transfer> {
        let mut out = HashMap::new();
        if let Some((_, slot)) = self.sessions.remove(sid) {
            for (tid, handle) in slot.transfers.into_iter() {
                let mut guard = handle.lock().await;
                if !guard.transfer.state.is_terminal() {
                    let _ = guard.cancel().await;
                }
                out.insert(tid, guard.transfer.clone());
            }
        }
        out
    }

    /// Sweeps every active transfer for `T_stall` inactivity (§4.4 item
    /// 7), failing each one found stalled. Callers react to what's
    /// returned (audit, notify, retire) the same way `cancel_all`'s
    /// callers do; this only transitions state.
    pub async fn reap_stalled(&self) -> Vec<(SessionId, Transfer)> {
        let candidates: Vec<(SessionId, Arc<Mutex<TransferHandle>>)> = self
            .sessions
            .iter()
            .flat_map(|entry| {
                let sid = entry.key().clone();
                entry
                    .value()
                    .transfers
                    .iter()
                    .map(|t| (sid.clone(), t.value().clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut out = Vec::new();
        for (sid, handle) in candidates {
            let mut guard = handle.lock().await;
            if guard.is_stalled(self.policy.t_stall) && guard.fail(TerminalReason::Stall).await.is_ok() {
                out.push((sid, guard.transfer.clone()));
            }
        }
        out
    }
}
