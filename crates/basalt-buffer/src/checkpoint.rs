//! Checkpoint dirty-buffer writing.
//!
//! A checkpoint must write every buffer that was dirty when it started.
//! The work runs in two phases: a marking scan flags each such buffer
//! with `CHECKPOINT_NEEDED` and collects its tag, then a write loop
//! walks the collected set sorted by tag (sequential within each file)
//! while round-robining across tablespaces so no single disk eats the
//! full write burst. Pacing between writes is delegated to a hook that
//! compares actual progress against `checkpoint_completion_target`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_common::types::TablespaceId;
use tracing::info;

use crate::error::BufferResult;
use crate::pool::BufferManager;
use crate::state::{BM_CHECKPOINT_NEEDED, BM_DIRTY, BM_PERMANENT};
use crate::tag::BufferTag;

/// What kind of checkpoint is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointFlags(u16);

impl CheckpointFlags {
    /// Shutdown checkpoint: unlogged buffers are written too.
    pub const IS_SHUTDOWN: u16 = 1 << 0;
    /// End-of-recovery checkpoint: unlogged buffers are written too.
    pub const END_OF_RECOVERY: u16 = 1 << 1;
    /// Finish as fast as possible; pacing hooks should not sleep.
    pub const IMMEDIATE: u16 = 1 << 2;
    /// Write every dirty buffer regardless of persistence.
    pub const FLUSH_ALL: u16 = 1 << 3;

    /// Creates empty flags.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Returns true if every bit in `bits` is set.
    #[inline]
    #[must_use]
    pub const fn has(self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    fn includes_unlogged(self) -> bool {
        self.0 & (Self::IS_SHUTDOWN | Self::END_OF_RECOVERY | Self::FLUSH_ALL) != 0
    }
}

/// Result of one checkpoint pass over the pool.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStats {
    /// Buffers that were dirty at checkpoint start.
    pub dirty_buffers: usize,
    /// Buffers this checkpoint actually wrote (concurrent flushers may
    /// have taken care of the rest).
    pub buffers_written: usize,
    /// Wall-clock duration of the write phase.
    pub elapsed: Duration,
}

/// One entry of the checkpoint's scratch array.
#[derive(Debug, Clone, Copy)]
struct CkptSortItem {
    tag: BufferTag,
    buf_id: usize,
}

/// Per-tablespace write pacing state, orderable for the balancing heap:
/// the tablespace with the least virtual progress writes next, ties
/// broken by tablespace id for determinism.
struct TsProgress {
    tablespace: TablespaceId,
    /// Offset of this tablespace's first item in the sorted array.
    start: usize,
    num_to_scan: usize,
    scanned: usize,
    progress: f64,
    slice: f64,
}

impl PartialEq for TsProgress {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for TsProgress {}

impl PartialOrd for TsProgress {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TsProgress {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the least progress wins.
        other
            .progress
            .total_cmp(&self.progress)
            .then_with(|| other.tablespace.cmp(&self.tablespace))
    }
}

impl BufferManager {
    /// Writes every buffer that is dirty at the start of the call.
    ///
    /// Ordinary checkpoints restrict themselves to permanent buffers;
    /// shutdown and end-of-recovery checkpoints (and `FLUSH_ALL`) take
    /// everything. Writes are sorted by tag and balanced across
    /// tablespaces; the pool's throttle hook is consulted between
    /// writes unless `IMMEDIATE` is set.
    pub fn checkpoint_buffers(&mut self, flags: CheckpointFlags) -> BufferResult<CheckpointStats> {
        let pool = Arc::clone(&self.pool);
        let started = Instant::now();

        // Phase 1: mark everything this checkpoint is responsible for.
        let mut items: Vec<CkptSortItem> = Vec::new();
        for buf_id in 0..pool.nbuffers() {
            let desc = pool.desc(buf_id);
            let mut guard = desc.state().lock();
            if guard.state.has(BM_DIRTY)
                && (flags.includes_unlogged() || guard.state.has(BM_PERMANENT))
            {
                guard.state = guard.state.set(BM_CHECKPOINT_NEEDED);
                let tag = desc.tag();
                drop(guard);
                items.push(CkptSortItem { tag, buf_id });
            }
        }

        let total = items.len();
        if total == 0 {
            return Ok(CheckpointStats::default());
        }

        // Phase 2: sort, then write in tablespace-balanced order.
        items.sort_by(|a, b| a.tag.cmp(&b.tag));

        let mut heap: BinaryHeap<TsProgress> = BinaryHeap::new();
        let mut start = 0;
        while start < items.len() {
            let tablespace = items[start].tag.rel.tablespace;
            let mut end = start + 1;
            while end < items.len() && items[end].tag.rel.tablespace == tablespace {
                end += 1;
            }
            let num_to_scan = end - start;
            heap.push(TsProgress {
                tablespace,
                start,
                num_to_scan,
                scanned: 0,
                progress: 0.0,
                slice: total as f64 / num_to_scan as f64,
            });
            start = end;
        }

        let throttle = if flags.has(CheckpointFlags::IMMEDIATE) {
            None
        } else {
            pool.throttle_hook()
        };

        let checkpoint_flush_after = if pool.config().io_direct_data() {
            0
        } else {
            pool.config().checkpoint_flush_after
        };
        self.writeback.set_flush_after(checkpoint_flush_after);

        let mut written = 0;
        let mut processed = 0;
        while let Some(mut ts) = heap.pop() {
            let item = items[ts.start + ts.scanned];
            // A concurrent flush may already have cleared the flag.
            if pool
                .desc(item.buf_id)
                .state()
                .load()
                .has(BM_CHECKPOINT_NEEDED)
            {
                let result = self.sync_one_buffer(item.buf_id, false);
                match result {
                    Ok(sync) => {
                        if sync.written {
                            written += 1;
                        }
                    }
                    Err(e) => {
                        self.restore_backend_flush_after();
                        return Err(e);
                    }
                }
            }
            processed += 1;
            ts.scanned += 1;
            if ts.scanned < ts.num_to_scan {
                ts.progress += ts.slice;
                heap.push(ts);
            }
            if let Some(hook) = &throttle {
                hook(processed as f64 / total as f64);
            }
        }

        self.issue_pending_writebacks();
        self.restore_backend_flush_after();

        let stats = CheckpointStats {
            dirty_buffers: total,
            buffers_written: written,
            elapsed: started.elapsed(),
        };
        info!(
            dirty = stats.dirty_buffers,
            written = stats.buffers_written,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "checkpoint write phase complete"
        );
        Ok(stats)
    }

    fn restore_backend_flush_after(&mut self) {
        let flush_after = if self.pool.config().io_direct_data() {
            0
        } else {
            self.pool.config().backend_flush_after
        };
        self.writeback.set_flush_after(flush_after);
    }
}
