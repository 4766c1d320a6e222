//! File I/O interface (§6): `open_temp` / `finalize` / `delete_temp` /
//! `read_source`. Grounded in this codebase's file-server `Storage` type
//! (pre-allocated temp files, verify-then-write per chunk, streaming
//! whole-file hash), adapted from a flat upload-directory layout to the
//! broker's `{temp_dir}/{tid}.part` scheme.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::TransferError;

#[derive(Clone)]
pub struct Storage {
    temp_dir: PathBuf,
}

impl Storage {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    pub fn temp_path(&self, tid: Uuid) -> PathBuf {
        self.temp_dir.join(format!("{tid}.part"))
    }

    /// Creates (or truncates) the temp file and pre-allocates it to
    /// `declared_size`, so out-of-order chunk writes never need to grow
    /// the file mid-transfer.
    pub async fn open_temp(&self, tid: Uuid, declared_size: u64) -> Result<File, TransferError> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        let path = self.temp_path(tid);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&path)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        file.set_len(declared_size)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        Ok(file)
    }

    /// Verifies `payload` against `chunk_checksum` and, only on match,
    /// writes it at `seq * chunk_size`. Returns `false` without writing
    /// on a checksum mismatch — the caller acks `status=corrupt` and does
    /// not advance the bitmap.
    pub async fn write_chunk(
        &self,
        file: &mut File,
        seq: u32,
        chunk_size: u32,
        payload: &[u8],
        expected_checksum: [u8; 32],
    ) -> Result<bool, TransferError> {
        let actual = broker_codec::chunk_checksum(payload);
        if actual != expected_checksum {
            return Ok(false);
        }
        let offset = seq as u64 * chunk_size as u64;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        file.write_all(payload)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        Ok(true)
    }

    pub async fn read_chunk(
        &self,
        file: &mut File,
        seq: u32,
        chunk_size: u32,
        declared_size: u64,
    ) -> Result<Vec<u8>, TransferError> {
        let offset = seq as u64 * chunk_size as u64;
        let len = chunk_size.min((declared_size - offset) as u32);
        let mut buf = vec![0u8; len as usize];
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        file.read_exact(&mut buf)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        Ok(buf)
    }

    /// Streaming SHA-256 over the whole temp file, used at completion to
    /// compare against `declared_checksum`.
    pub async fn verify_full_hash(&self, file: &mut File) -> Result<[u8; 32], TransferError> {
        file.seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| TransferError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }

    /// Atomically renames the temp file into its final resting place.
    pub async fn finalize(&self, tid: Uuid, final_path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::Io(e.to_string()))?;
        }
        tokio::fs::rename(self.temp_path(tid), final_path)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        Ok(())
    }

    /// Idempotent: a missing temp file is not an error.
    pub async fn delete_temp(&self, tid: Uuid) {
        let _ = tokio::fs::remove_file(self.temp_path(tid)).await;
    }
}
