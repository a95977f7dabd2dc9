use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::TransferError;

/// Failure recorded against one chunk position
#[derive(Debug)]
pub(crate) struct ChunkFailure {
    pub position: u32,
    pub error: TransferError,
}

/// Shared state of one logical transfer.
///
/// Workers update it concurrently through `&self`; callers never lock.
#[derive(Debug)]
pub struct TransferState {
    started: Instant,
    failed: AtomicBool,
    completed_chunks: AtomicU32,
    transferred_bytes: AtomicU64,
    first_error: Mutex<Option<ChunkFailure>>,
}

impl TransferState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            failed: AtomicBool::new(false),
            completed_chunks: AtomicU32::new(0),
            transferred_bytes: AtomicU64::new(0),
            first_error: Mutex::new(None),
        }
    }

    /// Record a chunk that reached the service
    pub fn record_success(&self, bytes: u64) {
        self.completed_chunks.fetch_add(1, Ordering::SeqCst);
        self.transferred_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Record a failed chunk; the failure with the lowest position is kept
    pub(crate) fn record_failure(&self, position: u32, error: TransferError) {
        self.failed.store(true, Ordering::SeqCst);
        let mut slot = self.first_error.lock();
        match slot.as_ref() {
            Some(existing) if existing.position <= position => {}
            _ => *slot = Some(ChunkFailure { position, error }),
        }
    }

    /// Whether any chunk has failed; no new chunks are scheduled once set
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn completed_chunks(&self) -> u32 {
        self.completed_chunks.load(Ordering::SeqCst)
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Take the earliest-by-position failure, if any
    pub(crate) fn take_failure(&self) -> Option<ChunkFailure> {
        self.first_error.lock().take()
    }
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new()
    }
}
