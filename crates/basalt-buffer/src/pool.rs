//! The shared buffer pool and per-session entry points.
//!
//! [`BufferPool`] owns the descriptor table, the mapping, and the
//! replacement state; it is created once and shared behind an `Arc`.
//! Every worker thread derives a [`BufferManager`] from it and calls all
//! buffer operations through that session object, which carries the
//! session-private state: pin tracking, the resource owner, the cleanup
//! wait signal, the writeback batch, and I/O counters.
//!
//! Lock ordering, which must stay globally acyclic:
//!
//! 1. pin before content lock
//! 2. mapping partition lock before header lock
//! 3. never two partition locks at once
//! 4. never a content lock while holding a partition lock
//! 5. WAL flush only under a pin, never under a content-exclusive or
//!    header lock

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use basalt_common::constants::BLCKSZ;
use basalt_common::types::{
    BackendId, BlockNumber, ForkNumber, Lsn, P_NEW,
};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::warn;

use crate::config::BufferPoolConfig;
use crate::descriptor::BufferDesc;
use crate::error::{BufferError, BufferResult};
use crate::extend::ExtendFlags;
use crate::guard::PinnedBuffer;
use crate::mapping::BufferMapping;
use crate::page;
use crate::pin::{PrivateRefCount, ResourceOwner};
use crate::smgr::{RelFileLocator, RelPersistence, Relation, StorageManager};
use crate::state::{
    StateGuard, BM_CHECKPOINT_NEEDED, BM_DIRTY, BM_IO_ERROR, BM_IO_IN_PROGRESS, BM_JUST_DIRTIED,
    BM_LOCKED, BM_PERMANENT, BM_PIN_COUNT_WAITER, BM_TAG_VALID, BM_VALID,
};
use crate::strategy::{AccessStrategy, StrategyControl};
use crate::tag::BufferTag;
use crate::wal::WalLink;
use crate::writeback::WritebackContext;
use crate::{Buffer, BufferPoolStats};

/// How a missing or damaged page is handled by [`BufferManager::read_buffer_extended`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBufferMode {
    /// Read from disk on miss; fail on a damaged page (unless the pool
    /// is configured to zero damaged pages).
    Normal,
    /// As `Normal`, but the caller promises not to WAL-log its changes.
    NormalNoLog,
    /// As `Normal`, but zero the page (with a warning) instead of
    /// failing when verification fails.
    ZeroOnError,
    /// On miss, zero-fill instead of reading; return with the content
    /// lock held exclusively.
    ZeroAndLock,
    /// As `ZeroAndLock`, but with cleanup-strength locking.
    ZeroAndCleanupLock,
}

/// Content-lock request passed to [`BufferManager::lock_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLockMode {
    /// Release the held content lock.
    Unlock,
    /// Acquire in share mode.
    Share,
    /// Acquire in exclusive mode.
    Exclusive,
}

/// Outcome of a [`BufferManager::prefetch_buffer`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetchResult {
    /// The block was already cached; a handle that
    /// [`BufferManager::read_recent_buffer`] can try to re-pin cheaply.
    pub recent_buffer: Option<Buffer>,
    /// An asynchronous read hint was possibly initiated.
    pub initiated_io: bool,
}

/// Per-session I/O accounting.
#[derive(Debug, Clone, Default)]
pub struct BufferUsage {
    /// Lookups satisfied from the pool.
    pub shared_blks_hit: u64,
    /// Blocks read from the storage manager.
    pub shared_blks_read: u64,
    /// Blocks first dirtied by this session.
    pub shared_blks_dirtied: u64,
    /// Blocks written out by this session.
    pub shared_blks_written: u64,
    /// Time spent in block reads (only with `track_io_timing`).
    pub read_time: Duration,
    /// Time spent in block writes (only with `track_io_timing`).
    pub write_time: Duration,
}

/// Outcome bits of [`BufferManager::sync_one_buffer`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SyncResult {
    /// The buffer was written out.
    pub written: bool,
    /// The buffer was unpinned and unused, i.e. the clock sweep could
    /// hand it out immediately.
    pub reusable: bool,
}

/// Wakeup channel for a session sleeping in the cleanup-lock protocol.
pub(crate) struct BackendSignal {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl BackendSignal {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Wakes the owning session.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cv.notify_one();
    }

    /// Sleeps until signaled, consuming the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cv.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Sleeps up to `timeout_ms`, consuming the signal if it arrived.
    /// Returns true if signaled.
    pub fn wait_timeout(&self, timeout_ms: u64) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.cv
                .wait_for(&mut signaled, Duration::from_millis(timeout_ms));
        }
        let got = *signaled;
        *signaled = false;
        got
    }
}

/// Hook the checkpoint write loop calls between writes; receives the
/// fraction of the dirty set written so far and may sleep to pace the
/// checkpoint toward `checkpoint_completion_target`.
pub type CheckpointThrottle = Arc<dyn Fn(f64) + Send + Sync>;

/// Hook consulted by [`BufferManager::check_snapshot_age`]; returns
/// false if the caller's snapshot is too old to use the page.
pub type SnapshotCheck = Arc<dyn Fn(&Relation, Lsn) -> bool + Send + Sync>;

/// The shared buffer pool.
pub struct BufferPool {
    /// Back-reference handed to sessions; always upgradable while any
    /// `&BufferPool` exists.
    self_ref: Weak<BufferPool>,
    config: BufferPoolConfig,
    descriptors: Vec<BufferDesc>,
    mapping: BufferMapping,
    strategy: StrategyControl,
    smgr: Arc<dyn StorageManager>,
    wal: Arc<dyn WalLink>,
    /// Per-relation extension mutexes, created on demand.
    extension_locks: Mutex<HashMap<RelFileLocator, Arc<Mutex<()>>>>,
    /// Cleanup-wait signals of live sessions.
    signals: RwLock<HashMap<BackendId, Arc<BackendSignal>>>,
    next_backend: AtomicU32,
    checkpoint_throttle: RwLock<Option<CheckpointThrottle>>,
    snapshot_check: RwLock<Option<SnapshotCheck>>,
    // Pool-wide counters.
    fetches: AtomicU64,
    hits: AtomicU64,
    reads: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

impl BufferPool {
    /// Creates a pool with `config.shared_buffers` slots, initially all
    /// free.
    pub fn new(
        config: BufferPoolConfig,
        smgr: Arc<dyn StorageManager>,
        wal: Arc<dyn WalLink>,
    ) -> BufferResult<Arc<Self>> {
        config.validate().map_err(BufferError::config)?;

        let nbuffers = config.shared_buffers;
        let descriptors = (0..nbuffers).map(|i| BufferDesc::new(i, BLCKSZ)).collect();
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            mapping: BufferMapping::new(config.mapping_partitions, nbuffers),
            strategy: StrategyControl::new(nbuffers),
            config,
            descriptors,
            smgr,
            wal,
            extension_locks: Mutex::new(HashMap::new()),
            signals: RwLock::new(HashMap::new()),
            next_backend: AtomicU32::new(0),
            checkpoint_throttle: RwLock::new(None),
            snapshot_check: RwLock::new(None),
            fetches: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }))
    }

    /// Creates a session entry point for the calling thread.
    pub fn new_session(&self) -> BufferManager {
        let backend = BackendId::new(self.next_backend.fetch_add(1, Ordering::Relaxed));
        let signal = Arc::new(BackendSignal::new());
        self.signals.write().insert(backend, Arc::clone(&signal));

        let flush_after = if self.config.io_direct_data() {
            0
        } else {
            self.config.backend_flush_after
        };
        BufferManager {
            pool: self
                .self_ref
                .upgrade()
                .expect("pool self-reference valid while the pool is alive"),
            backend,
            pins: PrivateRefCount::new(),
            resowner: ResourceOwner::new(),
            signal,
            writeback: WritebackContext::new(flush_after),
            usage: BufferUsage::default(),
            scratch: vec![0u8; BLCKSZ].into_boxed_slice(),
            in_progress_io: None,
            bgwriter: crate::bgwriter::BgWriterState::new(),
        }
    }

    /// Number of slots in the pool.
    #[inline]
    pub fn nbuffers(&self) -> usize {
        self.descriptors.len()
    }

    /// The pool's configuration.
    #[inline]
    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Installs the checkpoint pacing hook.
    pub fn set_checkpoint_throttle(&self, hook: CheckpointThrottle) {
        *self.checkpoint_throttle.write() = Some(hook);
    }

    /// Installs the old-snapshot check hook.
    pub fn set_snapshot_check(&self, hook: SnapshotCheck) {
        *self.snapshot_check.write() = Some(hook);
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned = 0;
        let mut dirty = 0;
        for desc in &self.descriptors {
            let state = desc.state().load();
            if state.refcount() > 0 {
                pinned += 1;
            }
            if state.has(BM_DIRTY) {
                dirty += 1;
            }
        }
        BufferPoolStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            pinned_buffers: pinned,
            dirty_buffers: dirty,
        }
    }

    // ---------------------------------------------------------------------
    // Crate-internal accessors
    // ---------------------------------------------------------------------

    #[inline]
    pub(crate) fn desc(&self, buf_id: usize) -> &BufferDesc {
        &self.descriptors[buf_id]
    }

    #[inline]
    pub(crate) fn descriptors(&self) -> &[BufferDesc] {
        &self.descriptors
    }

    #[inline]
    pub(crate) fn mapping(&self) -> &BufferMapping {
        &self.mapping
    }

    #[inline]
    pub(crate) fn strategy(&self) -> &StrategyControl {
        &self.strategy
    }

    #[inline]
    pub(crate) fn smgr(&self) -> &dyn StorageManager {
        self.smgr.as_ref()
    }

    #[inline]
    pub(crate) fn wal(&self) -> &dyn WalLink {
        self.wal.as_ref()
    }

    pub(crate) fn throttle_hook(&self) -> Option<CheckpointThrottle> {
        self.checkpoint_throttle.read().clone()
    }

    pub(crate) fn snapshot_hook(&self) -> Option<SnapshotCheck> {
        self.snapshot_check.read().clone()
    }

    /// Returns the extension mutex for a relation, creating it on first
    /// use.
    pub(crate) fn extension_lock(&self, rel: RelFileLocator) -> Arc<Mutex<()>> {
        let mut locks = self.extension_locks.lock();
        Arc::clone(locks.entry(rel).or_default())
    }

    /// Wakes the cleanup-waiter session `backend`, if it is still live.
    pub(crate) fn signal_backend(&self, backend: BackendId) {
        if let Some(signal) = self.signals.read().get(&backend) {
            signal.set();
        }
    }

    pub(crate) fn count_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    // ---------------------------------------------------------------------
    // Shared pin protocol
    //
    // The session layer tracks per-backend refcounts on top of these;
    // drop-released claims (see `guard.rs`) call them directly.
    // ---------------------------------------------------------------------

    /// Bumps the shared refcount, waiting out any header-lock holder.
    /// Returns whether the buffer was `VALID` at pin time.
    pub(crate) fn pin_shared(&self, buf_id: usize, strategy_pin: bool) -> bool {
        let desc = self.desc(buf_id);
        let mut state = desc.state().load();
        loop {
            if state.has(BM_LOCKED) {
                state = desc.state().wait_unlocked();
                continue;
            }
            let mut new = state.add_ref();
            if strategy_pin {
                if new.usage_count() == 0 {
                    new = new.with_usage(1);
                }
            } else {
                new = new.bump_usage();
            }
            match desc.state().cas(state, new) {
                Ok(()) => return new.has(BM_VALID),
                Err(observed) => state = observed,
            }
        }
    }

    /// Drops one shared pin, waking a cleanup waiter left at refcount 1.
    pub(crate) fn unpin_shared(&self, buf_id: usize) {
        let desc = self.desc(buf_id);
        let mut state = desc.state().load();
        loop {
            if state.has(BM_LOCKED) {
                state = desc.state().wait_unlocked();
                continue;
            }
            match desc.state().cas(state, state.sub_ref()) {
                Ok(()) => {
                    state = state.sub_ref();
                    break;
                }
                Err(observed) => state = observed,
            }
        }

        if state.has(BM_PIN_COUNT_WAITER) && state.refcount() == 1 {
            let mut guard = desc.state().lock();
            if guard.state.has(BM_PIN_COUNT_WAITER) && guard.state.refcount() == 1 {
                let waiter = desc.wait_backend();
                guard.state = guard.state.clear(BM_PIN_COUNT_WAITER);
                guard.unlock();
                self.signal_backend(waiter);
            }
        }
    }

    /// Sets `DIRTY | JUST_DIRTIED` on a pinned buffer. Returns true if
    /// the buffer was clean before.
    pub(crate) fn set_dirty_flags(&self, buf_id: usize) -> bool {
        let desc = self.desc(buf_id);
        let mut state = desc.state().load();
        loop {
            if state.has(BM_LOCKED) {
                state = desc.state().wait_unlocked();
                continue;
            }
            debug_assert!(state.refcount() > 0);
            match desc.state().cas(state, state.set(BM_DIRTY | BM_JUST_DIRTIED)) {
                Ok(()) => return !state.has(BM_DIRTY),
                Err(observed) => state = observed,
            }
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("nbuffers", &self.nbuffers())
            .field("cached_tags", &self.mapping.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Per-session entry point to the shared pool.
///
/// Not `Sync`: each worker thread owns its manager. Dropping a manager
/// releases every pin it still holds (with a leak warning per buffer).
pub struct BufferManager {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) backend: BackendId,
    pub(crate) pins: PrivateRefCount,
    pub(crate) resowner: ResourceOwner,
    pub(crate) signal: Arc<BackendSignal>,
    pub(crate) writeback: WritebackContext,
    pub(crate) usage: BufferUsage,
    pub(crate) scratch: Box<[u8]>,
    /// The single I/O claim this session may hold (buf_id, for_input).
    pub(crate) in_progress_io: Option<(usize, bool)>,
    pub(crate) bgwriter: crate::bgwriter::BgWriterState,
}

impl BufferManager {
    /// The session's backend identity.
    #[inline]
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// The shared pool this session operates on.
    #[inline]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// This session's I/O counters.
    #[inline]
    pub fn usage(&self) -> &BufferUsage {
        &self.usage
    }

    // =====================================================================
    // Read / pin path
    // =====================================================================

    /// Reads a block of a relation fork into the pool and pins it.
    ///
    /// The returned handle stays valid until released. In the
    /// `ZeroAndLock` modes the content lock is already held exclusively
    /// on return. The legacy `P_NEW` block number routes to relation
    /// extension.
    pub fn read_buffer_extended(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        block: BlockNumber,
        mode: ReadBufferMode,
        mut strategy: Option<&mut AccessStrategy>,
    ) -> BufferResult<Buffer> {
        self.check_relation_access(rel)?;
        if block == P_NEW {
            let (_, mut buffers, _) = self.extend_by(rel, fork, 1, ExtendFlags::empty(), None)?;
            return Ok(buffers.pop().unwrap_or(Buffer::INVALID));
        }

        let pool = Arc::clone(&self.pool);
        pool.count_fetch();
        let tag = BufferTag::new(rel.locator, fork, block);
        let hash = tag.stable_hash();

        // Fast path: the block is already mapped. Pinning happens under
        // the partition lock so the buffer cannot be evicted in between.
        let existing = {
            let partition = pool.mapping().partition_read(hash);
            partition
                .get(&tag)
                .copied()
                .map(|buf_id| (buf_id, self.pin_buffer(buf_id, strategy.as_deref())))
        };
        if let Some((buf_id, valid)) = existing {
            pool.count_hit();
            self.usage.shared_blks_hit += 1;
            if valid {
                self.lock_found_buffer(buf_id, mode)?;
            } else {
                self.complete_read(buf_id, &tag, mode)?;
            }
            return Ok(Buffer::from_buf_id(buf_id));
        }

        // Miss: take a clean victim, then try to install the tag.
        let victim = self.get_victim_buffer(strategy.as_deref_mut())?;
        let race = {
            let mut partition = pool.mapping().partition_write(hash);
            match partition.entry(tag) {
                Entry::Occupied(entry) => {
                    let buf_id = *entry.get();
                    Some((buf_id, self.pin_buffer(buf_id, strategy.as_deref())))
                }
                Entry::Vacant(entry) => {
                    entry.insert(victim);
                    let desc = pool.desc(victim);
                    let mut guard = desc.state().lock();
                    desc.set_tag(tag);
                    guard.state = guard.state.set(BM_TAG_VALID).with_usage(1);
                    if rel.fork_is_permanent(fork) {
                        guard.state = guard.state.set(BM_PERMANENT);
                    }
                    guard.unlock();
                    None
                }
            }
        };

        match race {
            Some((buf_id, valid)) => {
                // Someone else installed the same tag first: hand the
                // victim back and use theirs.
                self.release_victim(victim);
                pool.count_hit();
                self.usage.shared_blks_hit += 1;
                if valid {
                    self.lock_found_buffer(buf_id, mode)?;
                } else {
                    self.complete_read(buf_id, &tag, mode)?;
                }
                Ok(Buffer::from_buf_id(buf_id))
            }
            None => {
                self.complete_read(victim, &tag, mode)?;
                Ok(Buffer::from_buf_id(victim))
            }
        }
    }

    /// Tries to re-pin a previously returned handle for the same block,
    /// skipping the mapping lookup. Returns true on success, in which
    /// case the handle is pinned exactly as after a
    /// [`BufferManager::read_buffer_extended`] call.
    pub fn read_recent_buffer(
        &mut self,
        rel: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        prior: Buffer,
    ) -> BufferResult<bool> {
        let buf_id = self.check_handle(prior)?;
        let pool = Arc::clone(&self.pool);
        let tag = BufferTag::new(rel, fork, block);

        if self.pins.get(prior) > 0 {
            // Already pinned; the tag cannot change under us.
            if pool.desc(buf_id).tag() == tag {
                self.incr_ref(prior)?;
                pool.count_hit();
                self.usage.shared_blks_hit += 1;
                return Ok(true);
            }
            return Ok(false);
        }

        // Speculative pin, then recheck identity.
        let valid = self.pin_buffer(buf_id, None);
        if valid && pool.desc(buf_id).tag() == tag {
            pool.count_hit();
            self.usage.shared_blks_hit += 1;
            return Ok(true);
        }
        self.unpin_buffer(buf_id);
        Ok(false)
    }

    /// Hints that a block will be read soon.
    pub fn prefetch_buffer(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        block: BlockNumber,
    ) -> BufferResult<PrefetchResult> {
        self.check_relation_access(rel)?;
        let pool = Arc::clone(&self.pool);
        let tag = BufferTag::new(rel.locator, fork, block);

        if let Some(buf_id) = pool.mapping().lookup(&tag, tag.stable_hash()) {
            return Ok(PrefetchResult {
                recent_buffer: Some(Buffer::from_buf_id(buf_id)),
                initiated_io: false,
            });
        }
        if pool.config().io_direct_data() || pool.config().effective_io_concurrency == 0 {
            return Ok(PrefetchResult::default());
        }
        let initiated = pool.smgr().prefetch(rel.locator, fork, block);
        Ok(PrefetchResult {
            recent_buffer: None,
            initiated_io: initiated,
        })
    }

    /// Adds another local reference to an already-pinned buffer.
    pub fn incr_ref(&mut self, buffer: Buffer) -> BufferResult<()> {
        self.check_pinned(buffer)?;
        self.pins.reserve();
        if !self.pins.inc_existing(buffer) {
            return Err(BufferError::BadBufferId { buffer });
        }
        self.resowner.remember_buffer(buffer);
        Ok(())
    }

    /// Releases one pin on the buffer.
    pub fn release_buffer(&mut self, buffer: Buffer) -> BufferResult<()> {
        let buf_id = self.check_pinned(buffer)?;
        self.unpin_buffer(buf_id);
        Ok(())
    }

    /// Releases the content lock, then one pin.
    pub fn unlock_release_buffer(&mut self, buffer: Buffer) -> BufferResult<()> {
        self.lock_buffer(buffer, BufferLockMode::Unlock)?;
        self.release_buffer(buffer)
    }

    /// As [`BufferManager::read_buffer_extended`], but returns a
    /// [`PinnedBuffer`] claim whose drop releases the pin, instead of a
    /// handle the caller must remember to release. The zero-and-lock
    /// modes are not meaningful here; the claim manages content locking
    /// through its own page guards.
    pub fn read_buffer_guarded(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        block: BlockNumber,
        mode: ReadBufferMode,
        strategy: Option<&mut AccessStrategy>,
    ) -> BufferResult<PinnedBuffer> {
        let buffer = self.read_buffer_extended(rel, fork, block, mode, strategy)?;
        self.pin_guard(buffer)
    }

    /// Converts one of this session's pins on `buffer` into a
    /// [`PinnedBuffer`] claim that releases on drop. The session-tracked
    /// pin is consumed by the conversion.
    pub fn pin_guard(&mut self, buffer: Buffer) -> BufferResult<PinnedBuffer> {
        let buf_id = self.check_pinned(buffer)?;
        // The claim takes its own shared pin before the session pin is
        // dropped, so the refcount never dips to zero in between.
        let pinned = PinnedBuffer::new(Arc::clone(&self.pool), buf_id);
        self.unpin_buffer(buf_id);
        Ok(pinned)
    }

    // =====================================================================
    // Dirtying and flushing
    // =====================================================================

    /// Marks the buffer dirty. The caller must hold the content lock
    /// exclusively.
    pub fn mark_dirty(&mut self, buffer: Buffer) -> BufferResult<()> {
        let buf_id = self.check_pinned(buffer)?;
        debug_assert!(self.pool.desc(buf_id).page().is_locked_exclusive());
        if self.pool.set_dirty_flags(buf_id) {
            self.usage.shared_blks_dirtied += 1;
        }
        Ok(())
    }

    /// Marks the buffer dirty on behalf of a hint-bit update. The caller
    /// must hold at least a share content lock.
    ///
    /// When checksums are enabled and the buffer is permanent, a torn
    /// hint write could break the checksum, so a full-page WAL image is
    /// emitted first and the page LSN advanced to it; a checkpoint-start
    /// delay bracket is held while that record is written. No-op during
    /// recovery. `_is_standard_layout` allows the WAL layer to compress
    /// the image's free-space hole; it does not change buffer behavior.
    pub fn mark_dirty_hint(
        &mut self,
        buffer: Buffer,
        _is_standard_layout: bool,
    ) -> BufferResult<()> {
        let buf_id = self.check_pinned(buffer)?;
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);
        debug_assert!(desc.page().is_locked());

        let state = desc.state().load();
        if state.has(BM_DIRTY | BM_JUST_DIRTIED) {
            return Ok(());
        }
        if pool.wal().is_recovery() {
            return Ok(());
        }

        let guard_wal = pool.config().checksums_enabled && state.has(BM_PERMANENT);
        let mut lsn = Lsn::INVALID;
        if guard_wal {
            pool.wal().begin_delay_checkpoint();
            let result = {
                // Share lock held by the caller keeps exclusive writers out.
                let page_bytes = unsafe { desc.page().bytes() };
                pool.wal().log_full_page(page_bytes)
            };
            match result {
                Ok(record_lsn) => lsn = record_lsn,
                Err(e) => {
                    pool.wal().end_delay_checkpoint();
                    return Err(e);
                }
            }
        }

        let mut first_dirty = false;
        {
            let mut guard = desc.state().lock();
            debug_assert!(guard.state.refcount() > 0);
            if !guard.state.has(BM_DIRTY) {
                first_dirty = true;
                if lsn.is_valid() {
                    // Hint-bit discipline: an 8-byte stamp under share
                    // lock, serialized by the header lock against other
                    // hint writers.
                    unsafe { page::set_page_lsn(desc.page().bytes_mut(), lsn) };
                }
            }
            guard.state = guard.state.set(BM_DIRTY | BM_JUST_DIRTIED);
        }
        if guard_wal {
            pool.wal().end_delay_checkpoint();
        }
        if first_dirty {
            self.usage.shared_blks_dirtied += 1;
        }
        Ok(())
    }

    /// Writes one buffer out if it is dirty. The caller must hold a pin
    /// and the content lock (share mode suffices).
    pub fn flush_one_buffer(&mut self, buffer: Buffer) -> BufferResult<()> {
        let buf_id = self.check_pinned(buffer)?;
        debug_assert!(self.pool.desc(buf_id).page().is_locked());
        self.flush_buffer(buf_id)
    }

    // =====================================================================
    // Content locking
    // =====================================================================

    /// Acquires or releases the buffer's content lock.
    pub fn lock_buffer(&self, buffer: Buffer, mode: BufferLockMode) -> BufferResult<()> {
        let buf_id = self.check_pinned(buffer)?;
        let desc = self.pool.desc(buf_id);
        match mode {
            BufferLockMode::Share => desc.page().lock_shared(),
            BufferLockMode::Exclusive => desc.page().lock_exclusive(),
            BufferLockMode::Unlock => unsafe {
                if desc.page().is_locked_exclusive() {
                    desc.page().unlock_exclusive();
                } else {
                    desc.page().unlock_shared();
                }
            },
        }
        Ok(())
    }

    /// Tries to acquire the content lock exclusively without blocking.
    pub fn conditional_lock_buffer(&self, buffer: Buffer) -> BufferResult<bool> {
        let buf_id = self.check_pinned(buffer)?;
        Ok(self.pool.desc(buf_id).page().try_lock_exclusive())
    }

    /// Returns true if the buffer's content lock is held exclusively.
    pub fn buffer_is_exclusive_locked(&self, buffer: Buffer) -> BufferResult<bool> {
        let buf_id = self.check_pinned(buffer)?;
        Ok(self.pool.desc(buf_id).page().is_locked_exclusive())
    }

    /// Runs `f` over the page bytes. The caller must hold the content
    /// lock in at least share mode.
    pub fn with_page<R>(&self, buffer: Buffer, f: impl FnOnce(&[u8]) -> R) -> BufferResult<R> {
        let buf_id = self.check_pinned(buffer)?;
        let desc = self.pool.desc(buf_id);
        debug_assert!(desc.page().is_locked());
        Ok(f(unsafe { desc.page().bytes() }))
    }

    /// Runs `f` over the page bytes mutably. The caller must hold the
    /// content lock exclusively.
    pub fn with_page_mut<R>(
        &mut self,
        buffer: Buffer,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> BufferResult<R> {
        let buf_id = self.check_pinned(buffer)?;
        let desc = self.pool.desc(buf_id);
        debug_assert!(desc.page().is_locked_exclusive());
        Ok(f(unsafe { desc.page().bytes_mut() }))
    }

    // =====================================================================
    // Cleanup-lock protocol
    // =====================================================================

    /// Acquires the content lock exclusively and waits until this
    /// session's pin is the only one.
    ///
    /// The caller must hold the buffer pinned exactly once. If another
    /// session is already waiting for cleanup on this buffer, fails with
    /// [`BufferError::ConcurrentPinCountWaiters`].
    pub fn lock_for_cleanup(&mut self, buffer: Buffer) -> BufferResult<()> {
        self.check_pinned_once(buffer)?;
        let buf_id = buffer.buf_id();
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);
        let mut conflict_logged = false;
        let mut waited = Duration::ZERO;

        loop {
            desc.page().lock_exclusive();
            {
                let mut guard = desc.state().lock();
                if guard.state.refcount() == 1 {
                    // Ours alone; keep the content lock.
                    return Ok(());
                }
                if guard.state.has(BM_PIN_COUNT_WAITER) {
                    drop(guard);
                    unsafe { desc.page().unlock_exclusive() };
                    return Err(BufferError::ConcurrentPinCountWaiters { buffer });
                }
                desc.set_wait_backend(self.backend);
                guard.state = guard.state.set(BM_PIN_COUNT_WAITER);
            }
            unsafe { desc.page().unlock_exclusive() };

            // Sleep until the final unpinner wakes us. During recovery
            // the wait is chopped into deadlock_timeout slices so a
            // conflict can be reported.
            if pool.wal().is_recovery() {
                let timeout = pool.config().deadlock_timeout_ms;
                while !self.signal.wait_timeout(timeout) {
                    waited += Duration::from_millis(timeout);
                    if !conflict_logged {
                        warn!(
                            buffer = buffer.raw(),
                            waited_ms = waited.as_millis() as u64,
                            "recovery still waiting for buffer cleanup lock"
                        );
                        conflict_logged = true;
                    }
                }
            } else {
                self.signal.wait();
            }

            // The wake may be stale; drop the waiter flag if it is still
            // ours and retry from the top.
            {
                let mut guard = desc.state().lock();
                if guard.state.has(BM_PIN_COUNT_WAITER) && desc.wait_backend() == self.backend {
                    guard.state = guard.state.clear(BM_PIN_COUNT_WAITER);
                }
            }
        }
    }

    /// As [`BufferManager::lock_for_cleanup`], but returns false instead
    /// of sleeping.
    pub fn conditional_lock_for_cleanup(&mut self, buffer: Buffer) -> BufferResult<bool> {
        self.check_pinned_once(buffer)?;
        let desc = self.pool.desc(buffer.buf_id());
        if !desc.page().try_lock_exclusive() {
            return Ok(false);
        }
        let guard = desc.state().lock();
        if guard.state.refcount() == 1 {
            return Ok(true);
        }
        drop(guard);
        unsafe { desc.page().unlock_exclusive() };
        Ok(false)
    }

    /// Returns true if the buffer, already exclusively locked and pinned
    /// once by this session, satisfies cleanup strength right now.
    pub fn is_cleanup_ok(&self, buffer: Buffer) -> bool {
        let Ok(buf_id) = self.check_handle(buffer) else {
            return false;
        };
        if self.pins.get(buffer) != 1 {
            return false;
        }
        let desc = self.pool.desc(buf_id);
        if !desc.page().is_locked_exclusive() {
            return false;
        }
        let guard = desc.state().lock();
        guard.state.refcount() == 1
    }

    /// Errors unless this session holds exactly one pin on the buffer.
    pub fn check_pinned_once(&self, buffer: Buffer) -> BufferResult<()> {
        self.check_handle(buffer)?;
        if self.pins.get(buffer) != 1 {
            return Err(BufferError::BadBufferId { buffer });
        }
        Ok(())
    }

    /// Clears any cleanup-waiter flag this session armed. Called on
    /// abort paths before pins are released.
    pub fn unlock_buffers(&mut self) {
        let pool = Arc::clone(&self.pool);
        for (buffer, _) in self.pins.entries() {
            let desc = pool.desc(buffer.buf_id());
            let mut guard = desc.state().lock();
            if guard.state.has(BM_PIN_COUNT_WAITER) && desc.wait_backend() == self.backend {
                guard.state = guard.state.clear(BM_PIN_COUNT_WAITER);
            }
        }
    }

    // =====================================================================
    // Handle inspection
    // =====================================================================

    /// Returns the block number the pinned buffer caches.
    pub fn buffer_get_block_number(&self, buffer: Buffer) -> BufferResult<BlockNumber> {
        let buf_id = self.check_pinned(buffer)?;
        Ok(self.pool.desc(buf_id).tag().block)
    }

    /// Returns the full tag of the pinned buffer.
    pub fn buffer_get_tag(&self, buffer: Buffer) -> BufferResult<BufferTag> {
        let buf_id = self.check_pinned(buffer)?;
        Ok(self.pool.desc(buf_id).tag())
    }

    /// Returns true if the pinned buffer belongs to a WAL-logged fork.
    pub fn buffer_is_permanent(&self, buffer: Buffer) -> BufferResult<bool> {
        let buf_id = self.check_pinned(buffer)?;
        Ok(self.pool.desc(buf_id).state().load().has(BM_PERMANENT))
    }

    /// Returns true if the pinned buffer is dirty.
    pub fn buffer_is_dirty(&self, buffer: Buffer) -> BufferResult<bool> {
        let buf_id = self.check_pinned(buffer)?;
        Ok(self.pool.desc(buf_id).state().load().has(BM_DIRTY))
    }

    /// Reads the page LSN under the header lock, so the 8-byte stamp is
    /// consistent even against a concurrent hint-bit LSN advance.
    pub fn buffer_get_lsn_atomic(&self, buffer: Buffer) -> BufferResult<Lsn> {
        let buf_id = self.check_pinned(buffer)?;
        let desc = self.pool.desc(buf_id);
        let guard = desc.state().lock();
        let lsn = unsafe { page::page_lsn(desc.page().bytes()) };
        drop(guard);
        Ok(lsn)
    }

    /// Diagnostic description of a handle's pin state.
    pub fn debug_refcount(&self, buffer: Buffer) -> String {
        match self.check_handle(buffer) {
            Err(_) => format!("{buffer:?}"),
            Ok(buf_id) => {
                let desc = self.pool.desc(buf_id);
                let state = desc.state().load();
                format!(
                    "{:?} tag={} shared_ref={} usage={} local_ref={}",
                    buffer,
                    desc.tag(),
                    state.refcount(),
                    state.usage_count(),
                    self.pins.get(buffer),
                )
            }
        }
    }

    /// Consults the old-snapshot hook; errors with
    /// [`BufferError::SnapshotTooOld`] if the snapshot can no longer be
    /// used against this relation.
    pub fn check_snapshot_age(&self, rel: &Relation, snapshot_lsn: Lsn) -> BufferResult<()> {
        if let Some(hook) = self.pool.snapshot_hook() {
            if !hook(rel, snapshot_lsn) {
                return Err(BufferError::SnapshotTooOld);
            }
        }
        Ok(())
    }

    // =====================================================================
    // Session teardown
    // =====================================================================

    /// Aborts this session's in-flight I/O claim, if any: the buffer is
    /// flagged `IO_ERROR`, `IO_IN_PROGRESS` is cleared, and waiters are
    /// rebroadcast. A failed write leaves the buffer dirty for retry.
    pub fn abort_buffer_io(&mut self) {
        let Some((buf_id, for_input)) = self.in_progress_io else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);
        {
            let guard = desc.state().lock();
            debug_assert!(guard.state.has(BM_IO_IN_PROGRESS));
            if !for_input && guard.state.has(BM_IO_ERROR) {
                let failures = desc.note_io_error();
                warn!(
                    buffer = buf_id,
                    tag = %desc.tag(),
                    failures,
                    "repeated write failure, the error may be permanent"
                );
            } else if !for_input {
                desc.note_io_error();
            }
        }
        self.terminate_io(buf_id, false, BM_IO_ERROR);
    }

    /// Warns about and force-releases every pin this session still
    /// holds. Called at transaction end and from `Drop`.
    pub fn check_for_leaks(&mut self) {
        self.abort_buffer_io();
        self.unlock_buffers();
        for (buffer, count) in self.pins.entries() {
            warn!(
                refcount = count,
                "buffer leak: {}",
                self.debug_refcount(buffer)
            );
            for _ in 0..count {
                self.unpin_buffer(buffer.buf_id());
            }
        }
        debug_assert!(self.resowner.is_empty());
        self.resowner.take_all();
    }

    // =====================================================================
    // Internal pin protocol
    // =====================================================================

    /// Validates a shared-buffer handle.
    pub(crate) fn check_handle(&self, buffer: Buffer) -> BufferResult<usize> {
        if !buffer.is_valid() || buffer.is_local() || buffer.buf_id() >= self.pool.nbuffers() {
            return Err(BufferError::BadBufferId { buffer });
        }
        Ok(buffer.buf_id())
    }

    /// Validates a handle and requires this session to hold a pin.
    pub(crate) fn check_pinned(&self, buffer: Buffer) -> BufferResult<usize> {
        let buf_id = self.check_handle(buffer)?;
        if self.pins.get(buffer) == 0 {
            return Err(BufferError::BadBufferId { buffer });
        }
        Ok(buf_id)
    }

    pub(crate) fn check_relation_access(&self, rel: &Relation) -> BufferResult<()> {
        if let RelPersistence::Temp(owner) = rel.persistence {
            if owner != self.backend {
                return Err(BufferError::TempTableAccessForbidden);
            }
        }
        Ok(())
    }

    /// Pins a buffer, bumping the shared refcount on this session's
    /// first pin. Returns whether the buffer was `VALID` at pin time.
    pub(crate) fn pin_buffer(&mut self, buf_id: usize, strategy: Option<&AccessStrategy>) -> bool {
        let pool = Arc::clone(&self.pool);
        let buffer = Buffer::from_buf_id(buf_id);

        self.pins.reserve();
        if self.pins.inc_existing(buffer) {
            self.resowner.remember_buffer(buffer);
            return pool.desc(buf_id).state().load().has(BM_VALID);
        }

        let valid = pool.pin_shared(buf_id, strategy.is_some());
        self.pins.insert_new(buffer);
        self.resowner.remember_buffer(buffer);
        valid
    }

    /// Pins a buffer whose header lock the caller already holds,
    /// consuming the guard.
    pub(crate) fn pin_buffer_locked(&mut self, buf_id: usize, mut guard: StateGuard<'_>) {
        guard.state = guard.state.add_ref();
        guard.unlock();

        let buffer = Buffer::from_buf_id(buf_id);
        self.pins.reserve();
        if !self.pins.inc_existing(buffer) {
            self.pins.insert_new(buffer);
        }
        self.resowner.remember_buffer(buffer);
    }

    /// Drops one local pin; the shared refcount follows when the last
    /// local pin goes away, waking a cleanup waiter left at refcount 1.
    pub(crate) fn unpin_buffer(&mut self, buf_id: usize) {
        let buffer = Buffer::from_buf_id(buf_id);
        self.resowner.forget_buffer(buffer);
        if self.pins.dec(buffer) > 0 {
            return;
        }
        self.pool.unpin_shared(buf_id);
    }

    // =====================================================================
    // Victim acquisition
    // =====================================================================

    /// Acquires a pinned, clean, untagged buffer for reuse, flushing and
    /// invalidating a victim if necessary.
    pub(crate) fn get_victim_buffer(
        &mut self,
        mut strategy: Option<&mut AccessStrategy>,
    ) -> BufferResult<usize> {
        let pool = Arc::clone(&self.pool);
        loop {
            let (buf_id, from_ring) = {
                let (buf_id, guard) = pool
                    .strategy()
                    .get_victim(pool.descriptors(), strategy.as_deref_mut())?;
                let from_ring = strategy
                    .as_deref()
                    .is_some_and(AccessStrategy::current_was_in_ring);
                self.pin_buffer_locked(buf_id, guard);
                (buf_id, from_ring)
            };
            let desc = pool.desc(buf_id);

            if desc.state().load().has(BM_DIRTY) {
                // Writing it out needs a share content lock; the LSN
                // check for ring rejection happens under the same lock.
                desc.page().lock_shared();
                if from_ring {
                    let lsn = unsafe { page::page_lsn(desc.page().bytes()) };
                    if pool.wal().needs_flush(lsn)
                        && strategy
                            .as_deref_mut()
                            .is_some_and(AccessStrategy::reject_current)
                    {
                        unsafe { desc.page().unlock_shared() };
                        self.unpin_buffer(buf_id);
                        continue;
                    }
                }
                let flushed = self.flush_buffer(buf_id);
                unsafe { desc.page().unlock_shared() };
                if let Err(e) = flushed {
                    self.unpin_buffer(buf_id);
                    return Err(e);
                }
            }

            if desc.state().load().has(BM_TAG_VALID) {
                if !self.invalidate_victim(buf_id) {
                    // Someone pinned or re-dirtied it at the last moment.
                    self.unpin_buffer(buf_id);
                    continue;
                }
                pool.count_eviction();
            }

            return Ok(buf_id);
        }
    }

    /// Drops the victim's old tag from the mapping. Fails (and the
    /// caller retries elsewhere) if the buffer became pinned, dirty, or
    /// I/O-busy since it was chosen.
    pub(crate) fn invalidate_victim(&mut self, buf_id: usize) -> bool {
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);
        let tag = desc.tag();
        if !desc.state().load().has(BM_TAG_VALID) {
            return true;
        }

        let hash = tag.stable_hash();
        let mut partition = pool.mapping().partition_write(hash);
        let mut guard = desc.state().lock();
        if guard.state.refcount() != 1
            || guard.state.has_any(BM_DIRTY | BM_IO_IN_PROGRESS)
            || !guard.state.has(BM_TAG_VALID)
        {
            return false;
        }
        desc.set_tag(BufferTag::INVALID);
        guard.state = guard.state.clear(crate::state::BM_INVALIDATE_CLEAR).with_usage(0);
        guard.unlock();
        partition.remove(&tag);
        true
    }

    /// Returns an unused victim to the free pool after losing an
    /// install race.
    pub(crate) fn release_victim(&mut self, buf_id: usize) {
        self.unpin_buffer(buf_id);
        self.pool.strategy().free_buffer(buf_id);
    }

    // =====================================================================
    // Buffer I/O protocol
    // =====================================================================

    /// Claims the right to perform I/O on a buffer. Returns false if the
    /// I/O turns out to be unnecessary (page already valid for input,
    /// already clean for output), typically because a concurrent session
    /// did the work.
    pub(crate) fn start_io(&mut self, buf_id: usize, for_input: bool) -> bool {
        debug_assert!(self.in_progress_io.is_none());
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);
        loop {
            let mut guard = desc.state().lock();
            if !guard.state.has(BM_IO_IN_PROGRESS) {
                let no_io_needed = if for_input {
                    guard.state.has(BM_VALID)
                } else {
                    !guard.state.has(BM_DIRTY)
                };
                if no_io_needed {
                    return false;
                }
                guard.state = guard.state.set(BM_IO_IN_PROGRESS);
                guard.unlock();
                self.in_progress_io = Some((buf_id, for_input));
                return true;
            }
            drop(guard);
            desc.wait_io();
        }
    }

    /// Completes a claimed I/O: clears the in-progress and error flags,
    /// applies `set_flags`, optionally clears the dirty bit (unless the
    /// page was re-dirtied mid-write), and wakes waiters.
    pub(crate) fn terminate_io(&mut self, buf_id: usize, clear_dirty: bool, set_flags: u32) {
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);
        {
            let mut guard = desc.state().lock();
            debug_assert!(guard.state.has(BM_IO_IN_PROGRESS));
            guard.state = guard.state.clear(BM_IO_IN_PROGRESS | BM_IO_ERROR);
            if clear_dirty && !guard.state.has(BM_JUST_DIRTIED) {
                guard.state = guard.state.clear(BM_DIRTY | BM_CHECKPOINT_NEEDED);
            }
            guard.state = guard.state.set(set_flags);
        }
        self.in_progress_io = None;
        desc.broadcast_io();
    }

    /// Finishes a lookup that found the page valid: the zero-and-lock
    /// modes still acquire their content lock.
    fn lock_found_buffer(&mut self, buf_id: usize, mode: ReadBufferMode) -> BufferResult<()> {
        let buffer = Buffer::from_buf_id(buf_id);
        match mode {
            ReadBufferMode::ZeroAndLock => self.lock_buffer(buffer, BufferLockMode::Exclusive),
            ReadBufferMode::ZeroAndCleanupLock => self.lock_for_cleanup(buffer),
            _ => Ok(()),
        }
    }

    /// Runs the I/O-coordination dance on a pinned, tagged buffer that
    /// is not yet valid, reading (or zeroing) the page as `mode`
    /// demands.
    fn complete_read(
        &mut self,
        buf_id: usize,
        tag: &BufferTag,
        mode: ReadBufferMode,
    ) -> BufferResult<()> {
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);

        if !self.start_io(buf_id, true) {
            // Another session finished the read first.
            return self.lock_found_buffer(buf_id, mode);
        }

        let zero_instead_of_read = matches!(
            mode,
            ReadBufferMode::ZeroAndLock | ReadBufferMode::ZeroAndCleanupLock
        );
        if zero_instead_of_read {
            unsafe { desc.page().bytes_mut().fill(0) };
        } else {
            let io_start = self.io_timing_start();
            let read_result = {
                let page_bytes = unsafe { desc.page().bytes_mut() };
                pool.smgr().read(tag.rel, tag.fork, tag.block, page_bytes)
            };
            if let Err(e) = read_result {
                self.abort_buffer_io();
                return Err(e.into());
            }
            self.note_read_time(io_start);
            pool.count_read();
            self.usage.shared_blks_read += 1;

            let verify_ok = {
                let page_bytes = unsafe { desc.page().bytes() };
                page::verify_page(page_bytes, pool.config().checksums_enabled)
            };
            if !verify_ok {
                if mode == ReadBufferMode::ZeroOnError || pool.config().zero_damaged_pages {
                    warn!(tag = %tag, "invalid page; zeroing it");
                    unsafe { desc.page().bytes_mut().fill(0) };
                } else {
                    self.abort_buffer_io();
                    return Err(BufferError::CorruptPage {
                        rel: tag.rel,
                        fork: tag.fork,
                        block: tag.block,
                    });
                }
            }
        }

        // The zero-and-lock modes hand the page over already locked; the
        // lock is taken before VALID is published so no one can slip in.
        if zero_instead_of_read {
            desc.page().lock_exclusive();
        }
        self.terminate_io(buf_id, false, BM_VALID);
        Ok(())
    }

    // =====================================================================
    // Flushing
    // =====================================================================

    /// Writes a buffer's page to the storage manager, WAL-first. The
    /// caller must hold a pin and the content lock in at least share
    /// mode; a concurrent flusher turns this into a no-op.
    pub(crate) fn flush_buffer(&mut self, buf_id: usize) -> BufferResult<()> {
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);

        if !self.start_io(buf_id, false) {
            return Ok(());
        }
        let tag = desc.tag();

        // Capture the LSN and reset the re-dirty marker while the header
        // lock keeps both consistent.
        let (lsn, permanent) = {
            let mut guard = desc.state().lock();
            let lsn = unsafe { page::page_lsn(desc.page().bytes()) };
            let permanent = guard.state.has(BM_PERMANENT);
            guard.state = guard.state.clear(BM_JUST_DIRTIED);
            guard.unlock();
            (lsn, permanent)
        };

        // WAL before data.
        if permanent {
            if let Err(e) = pool.wal().flush_up_to(lsn) {
                self.abort_buffer_io();
                return Err(match e {
                    err @ BufferError::WalFlushError { .. } => err,
                    other => BufferError::WalFlushError {
                        lsn,
                        message: other.to_string(),
                    },
                });
            }
        }

        let io_start = self.io_timing_start();
        let write_result = {
            let page_bytes = unsafe { desc.page().bytes() };
            if pool.config().checksums_enabled {
                // Hint-bit writers may touch the shared page under share
                // lock; checksum a private copy so the stored checksum
                // matches the bytes actually written.
                page::checksum_page_copy(page_bytes, &mut self.scratch);
                pool.smgr().write(tag.rel, tag.fork, tag.block, &self.scratch, false)
            } else {
                pool.smgr().write(tag.rel, tag.fork, tag.block, page_bytes, false)
            }
        };

        match write_result {
            Ok(()) => {
                desc.clear_io_errors();
                self.note_write_time(io_start);
                pool.count_write();
                self.usage.shared_blks_written += 1;
                self.terminate_io(buf_id, true, 0);
                self.writeback.schedule(pool.smgr(), tag);
                Ok(())
            }
            Err(e) => {
                self.abort_buffer_io();
                Err(BufferError::WriteError {
                    rel: tag.rel,
                    block: tag.block,
                    source: e,
                })
            }
        }
    }

    /// Examines one buffer for the background writer and checkpoint
    /// paths; flushes it if it is dirty (and wanted).
    pub(crate) fn sync_one_buffer(
        &mut self,
        buf_id: usize,
        skip_recently_used: bool,
    ) -> BufferResult<SyncResult> {
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);

        let guard = desc.state().lock();
        let reusable = guard.state.refcount() == 0 && guard.state.usage_count() == 0;
        if skip_recently_used && !reusable {
            return Ok(SyncResult {
                written: false,
                reusable,
            });
        }
        if !guard.state.has(BM_VALID | BM_DIRTY) {
            return Ok(SyncResult {
                written: false,
                reusable,
            });
        }

        self.pin_buffer_locked(buf_id, guard);
        desc.page().lock_shared();
        let result = self.flush_buffer(buf_id);
        unsafe { desc.page().unlock_shared() };
        self.unpin_buffer(buf_id);
        result.map(|()| SyncResult {
            written: true,
            reusable,
        })
    }

    /// Issues any batched writeback hints.
    pub(crate) fn issue_pending_writebacks(&mut self) {
        let pool = Arc::clone(&self.pool);
        self.writeback.issue(pool.smgr());
    }

    fn io_timing_start(&self) -> Option<Instant> {
        self.pool.config().track_io_timing.then(Instant::now)
    }

    fn note_read_time(&mut self, start: Option<Instant>) {
        if let Some(start) = start {
            self.usage.read_time += start.elapsed();
        }
    }

    fn note_write_time(&mut self, start: Option<Instant>) {
        if let Some(start) = start {
            self.usage.write_time += start.elapsed();
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.check_for_leaks();
        self.pool.signals.write().remove(&self.backend);
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("backend", &self.backend)
            .field("held_pins", &self.pins.held_buffers())
            .field("usage", &self.usage)
            .finish()
    }
}
