// Transfer layer: resumable encrypted upload/download against the object
// store, plus the shared throttling/slot machinery.

pub mod download;
pub mod session;
pub mod store;
pub mod upload;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use indicatif::ProgressBar;

/// Upload/download part and range size.
pub const PART_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_PART_RETRIES: usize = 3;

/// Governs concurrent file transfers process-wide: a token per transfer slot
/// (bounded channel, blocking acquire) plus the live transfer count that the
/// range-worker budget reads.
pub struct TransferGovernor {
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    active: AtomicUsize,
    pub global_max_threads: usize,
    pub auto_scale: bool,
}

impl TransferGovernor {
    pub fn new(slots: usize, global_max_threads: usize, auto_scale: bool) -> Arc<Self> {
        let slots = slots.clamp(1, 10);
        let (slot_tx, slot_rx) = bounded::<()>(slots);
        for _ in 0..slots {
            let _ = slot_tx.send(());
        }
        Arc::new(TransferGovernor {
            slot_tx,
            slot_rx,
            active: AtomicUsize::new(0),
            global_max_threads,
            auto_scale,
        })
    }

    /// Blocks until a transfer slot frees up.
    pub fn begin(self: &Arc<Self>) -> TransferPermit {
        let _ = self.slot_rx.recv();
        self.active.fetch_add(1, Ordering::SeqCst);
        TransferPermit { governor: self.clone() }
    }

    pub fn active_transfers(&self) -> usize {
        self.active.load(Ordering::SeqCst).max(1)
    }

    /// Range workers for one file of the given size, accounting for sibling
    /// transfers currently holding slots.
    pub fn range_workers(&self, file_size: u64) -> usize {
        crate::budget::choose_range_workers(
            file_size,
            self.active_transfers(),
            self.global_max_threads,
            self.auto_scale,
        )
    }
}

/// RAII transfer slot. Returned to the pool on drop.
pub struct TransferPermit {
    governor: Arc<TransferGovernor>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.governor.active.fetch_sub(1, Ordering::SeqCst);
        let _ = self.governor.slot_tx.send(());
    }
}

/// Batches progress updates so the bars are not hammered per chunk.
pub struct Throttler {
    pending: u64,
    last_flush: Instant,
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}

impl Throttler {
    pub fn new() -> Self {
        Self { pending: 0, last_flush: Instant::now() }
    }

    #[inline]
    pub fn tick(&mut self, n: u64, pb: Option<&ProgressBar>, total_pb: Option<&ProgressBar>) {
        self.pending += n;
        if self.pending >= 64 * 1024 || self.last_flush.elapsed() >= Duration::from_millis(50) {
            self.flush(pb, total_pb);
        }
    }

    #[inline]
    pub fn flush(&mut self, pb: Option<&ProgressBar>, total_pb: Option<&ProgressBar>) {
        if self.pending > 0 {
            if let Some(pb) = pb {
                pb.inc(self.pending);
            }
            if let Some(pb) = total_pb {
                pb.inc(self.pending);
            }
            self.pending = 0;
            self.last_flush = Instant::now();
        }
    }
}
