//! Buffer descriptors: one per slot in the shared pool.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use basalt_common::types::BackendId;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};

use crate::state::{BufStateCell, BM_IO_IN_PROGRESS};
use crate::tag::BufferTag;

/// The page payload and the reader/writer lock guarding it.
///
/// The content lock must outlive any single function call (a caller can
/// acquire it in `read_buffer` and release it much later through
/// `lock_buffer(Unlock)`), so it is a raw lock rather than a guard-based
/// one. Byte access goes through the unsafe accessors below, whose
/// callers must hold the lock in the appropriate mode or own the
/// buffer's in-progress I/O.
pub(crate) struct PageSlot {
    lock: RawRwLock,
    bytes: UnsafeCell<Box<[u8]>>,
}

// The lock discipline documented on `bytes`/`bytes_mut` is what makes
// cross-thread access sound.
unsafe impl Send for PageSlot {}
unsafe impl Sync for PageSlot {}

impl PageSlot {
    fn new(blcksz: usize) -> Self {
        Self {
            lock: RawRwLock::INIT,
            bytes: UnsafeCell::new(vec![0u8; blcksz].into_boxed_slice()),
        }
    }

    /// Acquires the content lock in share mode.
    #[inline]
    pub fn lock_shared(&self) {
        self.lock.lock_shared();
    }

    /// Tries to acquire the content lock in share mode.
    #[inline]
    pub fn try_lock_shared(&self) -> bool {
        self.lock.try_lock_shared()
    }

    /// Acquires the content lock in exclusive mode.
    #[inline]
    pub fn lock_exclusive(&self) {
        self.lock.lock_exclusive();
    }

    /// Tries to acquire the content lock in exclusive mode.
    #[inline]
    pub fn try_lock_exclusive(&self) -> bool {
        self.lock.try_lock_exclusive()
    }

    /// Releases a share lock.
    ///
    /// # Safety
    ///
    /// The calling session must hold the lock in share mode.
    #[inline]
    pub unsafe fn unlock_shared(&self) {
        self.lock.unlock_shared();
    }

    /// Releases an exclusive lock.
    ///
    /// # Safety
    ///
    /// The calling session must hold the lock in exclusive mode.
    #[inline]
    pub unsafe fn unlock_exclusive(&self) {
        self.lock.unlock_exclusive();
    }

    /// Returns true if the lock is held in any mode.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Returns true if the lock is held exclusively.
    #[inline]
    pub fn is_locked_exclusive(&self) -> bool {
        self.lock.is_locked_exclusive()
    }

    /// Returns the page bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold the content lock in some mode, or own the
    /// buffer's `IO_IN_PROGRESS` claim while the buffer is not yet valid.
    #[inline]
    pub unsafe fn bytes(&self) -> &[u8] {
        &*self.bytes.get()
    }

    /// Returns the page bytes mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold the content lock exclusively, or own the
    /// buffer's `IO_IN_PROGRESS` claim while the buffer is not yet valid.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        &mut *self.bytes.get()
    }
}

/// One slot of the shared buffer pool.
///
/// The state word carries all flag/count bookkeeping; the tag and the
/// cleanup-waiter id are only written while the header lock (`BM_LOCKED`
/// in the state word) is held.
pub(crate) struct BufferDesc {
    buf_id: usize,
    tag: RwLock<BufferTag>,
    state: BufStateCell,
    wait_backend: AtomicU32,
    io_error_count: AtomicU32,
    page: PageSlot,
    io_sync: Mutex<()>,
    io_cv: Condvar,
}

impl BufferDesc {
    pub fn new(buf_id: usize, blcksz: usize) -> Self {
        Self {
            buf_id,
            tag: RwLock::new(BufferTag::INVALID),
            state: BufStateCell::new(),
            wait_backend: AtomicU32::new(BackendId::INVALID.as_u32()),
            io_error_count: AtomicU32::new(0),
            page: PageSlot::new(blcksz),
            io_sync: Mutex::new(()),
            io_cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn buf_id(&self) -> usize {
        self.buf_id
    }

    #[inline]
    pub fn state(&self) -> &BufStateCell {
        &self.state
    }

    #[inline]
    pub fn page(&self) -> &PageSlot {
        &self.page
    }

    /// Reads the tag. Stable while the caller holds a pin or the header
    /// lock; otherwise the value may be outdated by the next instant.
    #[inline]
    pub fn tag(&self) -> BufferTag {
        *self.tag.read()
    }

    /// Replaces the tag. Caller must hold the header lock.
    #[inline]
    pub fn set_tag(&self, tag: BufferTag) {
        *self.tag.write() = tag;
    }

    /// Returns the registered cleanup waiter.
    #[inline]
    pub fn wait_backend(&self) -> BackendId {
        BackendId::new(self.wait_backend.load(Ordering::Acquire))
    }

    /// Registers a cleanup waiter. Caller must hold the header lock.
    #[inline]
    pub fn set_wait_backend(&self, backend: BackendId) {
        self.wait_backend.store(backend.as_u32(), Ordering::Release);
    }

    /// Bumps the consecutive-write-failure counter, returning the new
    /// count.
    #[inline]
    pub fn note_io_error(&self) -> u32 {
        self.io_error_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Clears the write-failure counter after a successful I/O.
    #[inline]
    pub fn clear_io_errors(&self) {
        self.io_error_count.store(0, Ordering::Relaxed);
    }

    /// Blocks until no I/O is in progress on this buffer.
    pub fn wait_io(&self) {
        loop {
            if !self.state.load().has(BM_IO_IN_PROGRESS) {
                return;
            }
            let mut guard = self.io_sync.lock();
            // Re-check under the mutex so a broadcast between the check
            // and the wait cannot be missed.
            if self.state.load().has(BM_IO_IN_PROGRESS) {
                self.io_cv.wait(&mut guard);
            }
        }
    }

    /// Wakes every session waiting in [`BufferDesc::wait_io`]. Called
    /// after `IO_IN_PROGRESS` has been cleared.
    pub fn broadcast_io(&self) {
        let _guard = self.io_sync.lock();
        self.io_cv.notify_all();
    }
}
