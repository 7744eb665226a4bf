//! Drop-released claims over shared buffers.
//!
//! The handle-based surface on [`crate::pool::BufferManager`] mirrors
//! the engine's explicit pin/release discipline; these types are the
//! RAII rendition for callers that want the borrow checker holding the
//! claim. A [`PinnedBuffer`] owns one shared pin and hands out
//! content-lock guards over the page bytes:
//!
//! - [`PageReadGuard`] keeps the content lock in share mode and derefs
//!   to the page bytes
//! - [`PageWriteGuard`] keeps it exclusive, marks the buffer dirty on
//!   first mutable access, and derefs mutably
//!
//! Everything unwinds correctly in whatever order the values are
//! dropped, so an early `?` return cannot leak a pin or a lock.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use basalt_common::types::BlockNumber;

use crate::descriptor::BufferDesc;
use crate::pool::BufferPool;
use crate::tag::BufferTag;
use crate::Buffer;

/// A drop-released pin on one shared buffer.
///
/// Independent of any session's pin table: the claim owns its shared
/// refcount contribution outright and gives it back on drop.
pub struct PinnedBuffer {
    pool: Arc<BufferPool>,
    buf_id: usize,
}

impl PinnedBuffer {
    /// Takes a fresh shared pin on `buf_id`.
    pub(crate) fn new(pool: Arc<BufferPool>, buf_id: usize) -> Self {
        pool.pin_shared(buf_id, false);
        Self { pool, buf_id }
    }

    #[inline]
    fn desc(&self) -> &BufferDesc {
        self.pool.desc(self.buf_id)
    }

    /// The handle this claim pins.
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> Buffer {
        Buffer::from_buf_id(self.buf_id)
    }

    /// The tag of the pinned block. Stable while the claim exists.
    #[must_use]
    pub fn tag(&self) -> BufferTag {
        self.desc().tag()
    }

    /// The block number of the pinned block.
    #[must_use]
    pub fn block_number(&self) -> BlockNumber {
        self.tag().block
    }

    /// Locks the page for reading.
    pub fn read(&self) -> PageReadGuard<'_> {
        self.desc().page().lock_shared();
        PageReadGuard { pinned: self }
    }

    /// Locks the page for reading without blocking.
    pub fn try_read(&self) -> Option<PageReadGuard<'_>> {
        self.desc()
            .page()
            .try_lock_shared()
            .then(|| PageReadGuard { pinned: self })
    }

    /// Locks the page for writing.
    pub fn write(&self) -> PageWriteGuard<'_> {
        self.desc().page().lock_exclusive();
        PageWriteGuard {
            pinned: self,
            modified: false,
        }
    }

    /// Locks the page for writing without blocking.
    pub fn try_write(&self) -> Option<PageWriteGuard<'_>> {
        self.desc().page().try_lock_exclusive().then(|| PageWriteGuard {
            pinned: self,
            modified: false,
        })
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        self.pool.unpin_shared(self.buf_id);
    }
}

impl std::fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("buffer", &self.buffer())
            .field("tag", &self.tag())
            .finish()
    }
}

/// Read guard for a pinned page.
///
/// This guard:
/// - Provides read-only access to the page bytes
/// - Keeps the content lock in share mode while held
/// - Automatically unlocks when dropped
pub struct PageReadGuard<'a> {
    pinned: &'a PinnedBuffer,
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // The guard holds the content lock in share mode.
        unsafe { self.pinned.desc().page().bytes() }
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.pinned.desc().page().unlock_shared() };
    }
}

impl std::fmt::Debug for PageReadGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReadGuard")
            .field("buffer", &self.pinned.buffer())
            .finish()
    }
}

/// Write guard for a pinned page.
///
/// This guard:
/// - Provides read-write access to the page bytes
/// - Keeps the content lock exclusive while held
/// - Marks the buffer dirty on first mutable access
/// - Automatically unlocks when dropped
pub struct PageWriteGuard<'a> {
    pinned: &'a PinnedBuffer,
    /// Whether this guard has dirtied the buffer.
    modified: bool,
}

impl PageWriteGuard<'_> {
    /// Marks the buffer dirty without touching the bytes.
    pub fn mark_dirty(&mut self) {
        self.modified = true;
        self.pinned.pool.set_dirty_flags(self.pinned.buf_id);
    }

    /// Returns true if this guard has dirtied the buffer.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // The guard holds the content lock exclusively.
        unsafe { self.pinned.desc().page().bytes() }
    }
}

impl DerefMut for PageWriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        if !self.modified {
            self.mark_dirty();
        }
        unsafe { self.pinned.desc().page().bytes_mut() }
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.pinned.desc().page().unlock_exclusive() };
    }
}

impl std::fmt::Debug for PageWriteGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard")
            .field("buffer", &self.pinned.buffer())
            .field("modified", &self.modified)
            .finish()
    }
}
