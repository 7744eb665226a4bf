//! In-memory test doubles for the storage-manager and WAL seams.
//!
//! These back the crate's unit and integration tests and are exported so
//! downstream crates can test buffer-dependent code without touching a
//! filesystem. [`MemStorageManager`] keeps each relation fork as a vector
//! of blocks behind a mutex and counts every operation;
//! [`MemWal`] models a durable-up-to LSN. Both can append to a shared
//! [`TraceLog`] so tests can assert cross-seam ordering, e.g. that the
//! WAL flush for a page precedes its block write.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use basalt_common::constants::BLCKSZ;
use basalt_common::types::{BlockNumber, ForkNumber, Lsn};
use parking_lot::Mutex;

use crate::error::{BufferError, BufferResult};
use crate::smgr::{RelFileLocator, SmgrResult, StorageManager};
use crate::wal::WalLink;

/// One observable I/O-ordering event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// The WAL was flushed up to this LSN.
    WalFlush {
        /// Requested durability point.
        up_to: Lsn,
    },
    /// A block was written to the storage manager.
    BlockWrite {
        /// Relation written.
        rel: RelFileLocator,
        /// Fork written.
        fork: ForkNumber,
        /// Block written.
        block: BlockNumber,
    },
}

/// Shared ordered log of [`IoEvent`]s.
pub type TraceLog = Arc<Mutex<Vec<IoEvent>>>;

/// Creates an empty trace log to share between doubles.
#[must_use]
pub fn new_trace_log() -> TraceLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// In-memory storage manager.
pub struct MemStorageManager {
    files: Mutex<HashMap<(RelFileLocator, ForkNumber), Vec<Box<[u8]>>>>,
    reads: AtomicU64,
    writes: AtomicU64,
    prefetches: AtomicU64,
    write_log: Mutex<Vec<(RelFileLocator, ForkNumber, BlockNumber)>>,
    writeback_log: Mutex<Vec<(RelFileLocator, ForkNumber, BlockNumber, usize)>>,
    fail_writes: AtomicBool,
    trace: Mutex<Option<TraceLog>>,
}

impl MemStorageManager {
    /// Creates an empty storage manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            prefetches: AtomicU64::new(0),
            write_log: Mutex::new(Vec::new()),
            writeback_log: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            trace: Mutex::new(None),
        }
    }

    /// Attaches a shared trace log.
    pub fn set_trace(&self, trace: TraceLog) {
        *self.trace.lock() = Some(trace);
    }

    /// Creates a fork pre-populated with `nblocks` zero pages.
    pub fn create_relation(&self, rel: RelFileLocator, fork: ForkNumber, nblocks: usize) {
        let blocks = (0..nblocks)
            .map(|_| vec![0u8; BLCKSZ].into_boxed_slice())
            .collect();
        self.files.lock().insert((rel, fork), blocks);
    }

    /// Stores a page directly, extending the fork as needed. Test setup
    /// only; bypasses all counters.
    pub fn put_page(&self, rel: RelFileLocator, fork: ForkNumber, block: BlockNumber, page: &[u8]) {
        assert_eq!(page.len(), BLCKSZ);
        let mut files = self.files.lock();
        let blocks = files.entry((rel, fork)).or_default();
        while blocks.len() <= block as usize {
            blocks.push(vec![0u8; BLCKSZ].into_boxed_slice());
        }
        blocks[block as usize].copy_from_slice(page);
    }

    /// Returns a copy of a stored page.
    #[must_use]
    pub fn get_page(&self, rel: RelFileLocator, fork: ForkNumber, block: BlockNumber) -> Vec<u8> {
        self.files.lock()[&(rel, fork)][block as usize].to_vec()
    }

    /// Number of block reads served.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of block writes performed.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of prefetch hints received.
    #[must_use]
    pub fn prefetch_count(&self) -> u64 {
        self.prefetches.load(Ordering::Relaxed)
    }

    /// Every block write, in order.
    #[must_use]
    pub fn write_log(&self) -> Vec<(RelFileLocator, ForkNumber, BlockNumber)> {
        self.write_log.lock().clone()
    }

    /// Every writeback hint issued, as `(rel, fork, first, nblocks)`.
    #[must_use]
    pub fn writeback_calls(&self) -> Vec<(RelFileLocator, ForkNumber, BlockNumber, usize)> {
        self.writeback_log.lock().clone()
    }

    /// Makes every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl Default for MemStorageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageManager for MemStorageManager {
    fn exists(&self, rel: RelFileLocator, fork: ForkNumber) -> bool {
        self.files.lock().contains_key(&(rel, fork))
    }

    fn create(&self, rel: RelFileLocator, fork: ForkNumber) -> SmgrResult<()> {
        self.files.lock().entry((rel, fork)).or_default();
        Ok(())
    }

    fn read(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        buf: &mut [u8],
    ) -> SmgrResult<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let files = self.files.lock();
        let blocks = files.get(&(rel, fork)).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no fork {fork} of {rel}"))
        })?;
        let page = blocks.get(block as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("block {block} past end of {rel}/{fork}"),
            )
        })?;
        buf.copy_from_slice(page);
        Ok(())
    }

    fn write(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        buf: &[u8],
        _skip_fsync: bool,
    ) -> SmgrResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let mut files = self.files.lock();
        let blocks = files.get_mut(&(rel, fork)).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no fork {fork} of {rel}"))
        })?;
        let page = blocks.get_mut(block as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("write of block {block} past end of {rel}/{fork}"),
            )
        })?;
        page.copy_from_slice(buf);
        drop(files);

        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_log.lock().push((rel, fork, block));
        if let Some(trace) = self.trace.lock().as_ref() {
            trace.lock().push(IoEvent::BlockWrite { rel, fork, block });
        }
        Ok(())
    }

    fn zero_extend(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        first: BlockNumber,
        nblocks: usize,
        _skip_fsync: bool,
    ) -> SmgrResult<()> {
        let mut files = self.files.lock();
        let blocks = files.entry((rel, fork)).or_default();
        // Writing zeros past the end would leave a hole; anything below
        // the current size is already backed and left untouched.
        if (first as usize) > blocks.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "zero_extend at block {first} but {rel}/{fork} has {} blocks",
                    blocks.len()
                ),
            ));
        }
        let target = first as usize + nblocks;
        while blocks.len() < target {
            blocks.push(vec![0u8; BLCKSZ].into_boxed_slice());
        }
        Ok(())
    }

    fn writeback(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        first: BlockNumber,
        nblocks: usize,
    ) -> SmgrResult<()> {
        self.writeback_log.lock().push((rel, fork, first, nblocks));
        Ok(())
    }

    fn prefetch(&self, _rel: RelFileLocator, _fork: ForkNumber, _block: BlockNumber) -> bool {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn nblocks(&self, rel: RelFileLocator, fork: ForkNumber) -> SmgrResult<BlockNumber> {
        Ok(self
            .files
            .lock()
            .get(&(rel, fork))
            .map_or(0, |blocks| blocks.len() as BlockNumber))
    }

    fn nblocks_cached(&self, rel: RelFileLocator, fork: ForkNumber) -> Option<BlockNumber> {
        self.files
            .lock()
            .get(&(rel, fork))
            .map(|blocks| blocks.len() as BlockNumber)
    }
}

/// In-memory WAL double: an advancing insert position and a durable-up-to
/// point.
pub struct MemWal {
    insert_lsn: AtomicU64,
    flushed_lsn: AtomicU64,
    recovery: AtomicBool,
    fail_flush: AtomicBool,
    delay_depth: AtomicU64,
    flush_log: Mutex<Vec<Lsn>>,
    trace: Mutex<Option<TraceLog>>,
}

impl MemWal {
    /// Creates a WAL double with nothing written yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            insert_lsn: AtomicU64::new(0),
            flushed_lsn: AtomicU64::new(0),
            recovery: AtomicBool::new(false),
            fail_flush: AtomicBool::new(false),
            delay_depth: AtomicU64::new(0),
            flush_log: Mutex::new(Vec::new()),
            trace: Mutex::new(None),
        }
    }

    /// Attaches a shared trace log.
    pub fn set_trace(&self, trace: TraceLog) {
        *self.trace.lock() = Some(trace);
    }

    /// Simulates inserting a WAL record; returns its LSN.
    pub fn advance(&self) -> Lsn {
        Lsn::new(self.insert_lsn.fetch_add(8, Ordering::Relaxed) + 8)
    }

    /// The durable-up-to point.
    #[must_use]
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn::new(self.flushed_lsn.load(Ordering::Relaxed))
    }

    /// Every flush request, in order.
    #[must_use]
    pub fn flush_log(&self) -> Vec<Lsn> {
        self.flush_log.lock().clone()
    }

    /// Puts the WAL into (or out of) recovery.
    pub fn set_recovery(&self, in_recovery: bool) {
        self.recovery.store(in_recovery, Ordering::Relaxed);
    }

    /// Makes every subsequent flush fail.
    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::Relaxed);
    }

    /// Current checkpoint-delay bracket depth.
    #[must_use]
    pub fn delay_depth(&self) -> u64 {
        self.delay_depth.load(Ordering::Relaxed)
    }
}

impl Default for MemWal {
    fn default() -> Self {
        Self::new()
    }
}

impl WalLink for MemWal {
    fn flush_up_to(&self, lsn: Lsn) -> BufferResult<()> {
        if self.fail_flush.load(Ordering::Relaxed) {
            return Err(BufferError::WalFlushError {
                lsn,
                message: "injected WAL flush failure".into(),
            });
        }
        self.flushed_lsn.fetch_max(lsn.as_u64(), Ordering::Relaxed);
        self.flush_log.lock().push(lsn);
        if let Some(trace) = self.trace.lock().as_ref() {
            trace.lock().push(IoEvent::WalFlush { up_to: lsn });
        }
        Ok(())
    }

    fn needs_flush(&self, lsn: Lsn) -> bool {
        lsn.is_valid() && lsn.as_u64() > self.flushed_lsn.load(Ordering::Relaxed)
    }

    fn log_full_page(&self, _page: &[u8]) -> BufferResult<Lsn> {
        Ok(self.advance())
    }

    fn is_recovery(&self) -> bool {
        self.recovery.load(Ordering::Relaxed)
    }

    fn begin_delay_checkpoint(&self) {
        self.delay_depth.fetch_add(1, Ordering::Relaxed);
    }

    fn end_delay_checkpoint(&self) {
        self.delay_depth.fetch_sub(1, Ordering::Relaxed);
    }
}
