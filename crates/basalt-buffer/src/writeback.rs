//! Coalesced writeback hints.
//!
//! After writing a block, a flusher does not want the kernel to sit on
//! the dirty page indefinitely, but issuing a hint per block is wasteful.
//! Each writer accumulates written tags in a small pending list; when the
//! list fills (or the writer finishes a batch) the tags are sorted,
//! consecutive blocks of the same fork are fused into runs, and one
//! writeback hint is issued per run. Everything here is advisory: errors
//! from the storage manager are ignored.

use basalt_common::constants::WRITEBACK_MAX_PENDING;

use crate::smgr::StorageManager;
use crate::tag::BufferTag;

/// A per-writer batch of pending writeback requests.
pub(crate) struct WritebackContext {
    /// Issue threshold; 0 disables writeback accumulation entirely.
    flush_after: usize,
    pending: Vec<BufferTag>,
}

impl WritebackContext {
    pub fn new(flush_after: usize) -> Self {
        let flush_after = flush_after.min(WRITEBACK_MAX_PENDING);
        Self {
            flush_after,
            pending: Vec::with_capacity(flush_after),
        }
    }

    /// Reconfigures the threshold (the bgwriter and checkpointer run
    /// with their own settings on a shared session).
    pub fn set_flush_after(&mut self, flush_after: usize) {
        self.flush_after = flush_after.min(WRITEBACK_MAX_PENDING);
    }

    /// Queues one written block, issuing the batch if it is full.
    pub fn schedule(&mut self, smgr: &dyn StorageManager, tag: BufferTag) {
        if self.flush_after == 0 {
            return;
        }
        self.pending.push(tag);
        if self.pending.len() >= self.flush_after {
            self.issue(smgr);
        }
    }

    /// Sorts the pending tags, fuses consecutive runs, and issues one
    /// hint per run.
    pub fn issue(&mut self, smgr: &dyn StorageManager) {
        if self.pending.is_empty() {
            return;
        }
        self.pending.sort();

        let mut run_start = 0;
        for i in 1..=self.pending.len() {
            let extends_run = i < self.pending.len() && {
                let prev = &self.pending[i - 1];
                let cur = &self.pending[i];
                cur.rel == prev.rel && cur.fork == prev.fork && cur.block == prev.block + 1
            };
            if extends_run {
                continue;
            }
            let first = &self.pending[run_start];
            let nblocks = i - run_start;
            // Advisory only; a failed hint costs nothing.
            let _ = smgr.writeback(first.rel, first.fork, first.block, nblocks);
            run_start = i;
        }
        self.pending.clear();
    }
}
