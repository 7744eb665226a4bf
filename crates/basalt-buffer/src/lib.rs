//! Shared buffer pool manager for BasaltDB.
//!
//! The buffer pool is a fixed-size in-memory cache of fixed-size disk
//! blocks shared by every worker thread, providing:
//!
//! - **Page caching**: tag-addressed lookup through a partitioned hash
//! - **Pin/unpin**: per-session refcounting layered over a shared count
//! - **Clock-sweep replacement**: with bounded rings for bulk scans
//! - **WAL-ordered flushing**: no page reaches disk before its WAL
//! - **Checkpointing**: tablespace-balanced, throttled dirty-page writes
//! - **Background writing**: LRU-ahead cleaning driven by allocation rate
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         BufferPool                           │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │   Mapping: partitioned hash  BufferTag -> buf_id       │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                             │                                │
//! │                             ▼                                │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │   Descriptors: state word · tag · content lock · page  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                             │                                │
//! │                             ▼                                │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │   Strategy: free list · clock sweep · scan rings       │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!          ▲ per-session entry point: BufferManager
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use basalt_buffer::config::BufferPoolConfig;
//! use basalt_buffer::pool::{BufferPool, ReadBufferMode};
//! use basalt_buffer::smgr::{Relation, RelFileLocator};
//! use basalt_buffer::testing::{MemStorageManager, MemWal};
//! use basalt_common::types::ForkNumber;
//!
//! fn example() -> basalt_buffer::error::BufferResult<()> {
//!     let smgr = Arc::new(MemStorageManager::new());
//!     let wal = Arc::new(MemWal::new());
//!     let pool = BufferPool::new(BufferPoolConfig::new(128), smgr, wal)?;
//!
//!     let mut session = pool.new_session();
//!     let rel = Relation::permanent(RelFileLocator::default());
//!     let buf = session.read_buffer_extended(
//!         &rel, ForkNumber::Main, 0, ReadBufferMode::Normal, None)?;
//!     session.release_buffer(buf)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Pool configuration
pub mod config;
/// Error types
pub mod error;
/// Thin page-header helpers used by the read and flush paths
pub mod page;
/// The pool itself and per-session entry points
pub mod pool;
/// Storage manager interface
pub mod smgr;
/// Ring access strategies
pub mod strategy;
/// Write-ahead log interface
pub mod wal;
/// In-memory test doubles for the SMGR and WAL seams
pub mod testing;

mod bgwriter;
mod bulk;
mod checkpoint;
mod descriptor;
mod extend;
mod guard;
mod mapping;
mod pin;
mod state;
mod tag;
mod writeback;

pub use bgwriter::BgWriterStats;
pub use checkpoint::{CheckpointFlags, CheckpointStats};
pub use extend::ExtendFlags;
pub use guard::{PageReadGuard, PageWriteGuard, PinnedBuffer};
pub use pool::{
    BufferLockMode, BufferManager, BufferPool, BufferUsage, PrefetchResult, ReadBufferMode,
};
pub use strategy::{AccessStrategy, AccessStrategyKind};
pub use tag::BufferTag;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a buffer in the shared pool.
///
/// A dense descriptor index offset by one: the raw value 0 is the
/// invalid handle, positive values name shared buffers, and negative
/// values are reserved for the session-local buffer manager.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Buffer(i32);

impl Buffer {
    /// The invalid handle.
    pub const INVALID: Self = Self(0);

    /// Creates a handle for a shared descriptor index.
    #[inline]
    #[must_use]
    pub const fn from_buf_id(buf_id: usize) -> Self {
        Self(buf_id as i32 + 1)
    }

    /// Returns the descriptor index this handle names.
    ///
    /// Only meaningful for valid shared handles.
    #[inline]
    #[must_use]
    pub const fn buf_id(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Returns the raw handle value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Returns true if this handle names any buffer at all.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns true if this handle names a session-local buffer.
    #[inline]
    #[must_use]
    pub const fn is_local(self) -> bool {
        self.0 < 0
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "Buffer(INVALID)")
        } else {
            write!(f, "Buffer({})", self.0)
        }
    }
}

/// Point-in-time statistics about the pool.
#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    /// Total lookups served.
    pub fetches: u64,
    /// Lookups satisfied without disk I/O.
    pub hits: u64,
    /// Lookups that required a block read.
    pub reads: u64,
    /// Buffers whose previous contents were evicted.
    pub evictions: u64,
    /// Dirty blocks written out.
    pub writes: u64,
    /// Buffers currently pinned by some session.
    pub pinned_buffers: usize,
    /// Buffers currently dirty.
    pub dirty_buffers: usize,
}

impl BufferPoolStats {
    /// Returns the cache hit ratio (0.0 to 1.0).
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        if self.fetches == 0 {
            0.0
        } else {
            self.hits as f64 / self.fetches as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_handle_encoding() {
        assert!(!Buffer::INVALID.is_valid());
        let buf = Buffer::from_buf_id(0);
        assert!(buf.is_valid());
        assert!(!buf.is_local());
        assert_eq!(buf.raw(), 1);
        assert_eq!(buf.buf_id(), 0);

        let buf = Buffer::from_buf_id(41);
        assert_eq!(buf.buf_id(), 41);
    }

    #[test]
    fn test_stats_hit_ratio() {
        let mut stats = BufferPoolStats::default();
        assert_eq!(stats.hit_ratio(), 0.0);

        stats.fetches = 100;
        stats.hits = 80;
        assert!((stats.hit_ratio() - 0.8).abs() < f64::EPSILON);
    }
}
