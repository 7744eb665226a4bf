//! Storage manager interface.
//!
//! The buffer pool never touches files itself; all block-level I/O goes
//! through the [`StorageManager`] trait. Implementations map a
//! [`RelFileLocator`] plus fork to an on-disk file and perform
//! position-based reads and writes.

use std::fmt;
use std::io;

use basalt_common::types::{BackendId, BlockNumber, DatabaseId, ForkNumber, RelationId, TablespaceId};
use serde::{Deserialize, Serialize};

/// Result type for storage manager operations.
pub type SmgrResult<T> = io::Result<T>;

/// Physical address of a relation: which tablespace and database it lives
/// in and which file set stores it.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RelFileLocator {
    /// Tablespace the relation is stored in.
    pub tablespace: TablespaceId,
    /// Database the relation belongs to.
    pub database: DatabaseId,
    /// The relation's file identifier.
    pub relation: RelationId,
}

impl RelFileLocator {
    /// Creates a new locator.
    #[inline]
    #[must_use]
    pub const fn new(tablespace: TablespaceId, database: DatabaseId, relation: RelationId) -> Self {
        Self {
            tablespace,
            database,
            relation,
        }
    }
}

impl fmt::Debug for RelFileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelFileLocator({}/{}/{})",
            self.tablespace, self.database, self.relation
        )
    }
}

impl fmt::Display for RelFileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tablespace, self.database, self.relation)
    }
}

/// Durability class of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelPersistence {
    /// WAL-logged, survives crashes.
    Permanent,
    /// Not WAL-logged; truncated on crash recovery.
    Unlogged,
    /// Session-private; visible only to the owning backend.
    Temp(BackendId),
}

/// A relation as the buffer pool sees it: a locator plus its durability
/// class. Higher layers carry catalogs and schemas; none of that matters
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    /// Physical address of the relation.
    pub locator: RelFileLocator,
    /// Durability class.
    pub persistence: RelPersistence,
}

impl Relation {
    /// Creates a permanent relation.
    #[must_use]
    pub const fn permanent(locator: RelFileLocator) -> Self {
        Self {
            locator,
            persistence: RelPersistence::Permanent,
        }
    }

    /// Creates an unlogged relation.
    #[must_use]
    pub const fn unlogged(locator: RelFileLocator) -> Self {
        Self {
            locator,
            persistence: RelPersistence::Unlogged,
        }
    }

    /// Creates a session-private relation owned by `backend`.
    #[must_use]
    pub const fn temp(locator: RelFileLocator, backend: BackendId) -> Self {
        Self {
            locator,
            persistence: RelPersistence::Temp(backend),
        }
    }

    /// Returns true if pages of this fork must obey the WAL-before-data
    /// rule. The init fork of an unlogged relation is itself logged.
    #[inline]
    #[must_use]
    pub fn fork_is_permanent(&self, fork: ForkNumber) -> bool {
        matches!(self.persistence, RelPersistence::Permanent) || fork == ForkNumber::Init
    }
}

/// Block-level storage operations on relation forks.
///
/// All operations are synchronous and position-based so they are safe to
/// call from any thread. `buf` slices are always exactly `BLCKSZ` long.
pub trait StorageManager: Send + Sync {
    /// Returns true if the fork exists on disk.
    fn exists(&self, rel: RelFileLocator, fork: ForkNumber) -> bool;

    /// Creates the fork (no-op if it already exists).
    fn create(&self, rel: RelFileLocator, fork: ForkNumber) -> SmgrResult<()>;

    /// Reads one block into `buf`.
    fn read(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        buf: &mut [u8],
    ) -> SmgrResult<()>;

    /// Writes one block from `buf`.
    fn write(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> SmgrResult<()>;

    /// Extends the fork by `nblocks` zero-filled blocks starting at
    /// `first`, which must equal the current fork size.
    fn zero_extend(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        first: BlockNumber,
        nblocks: usize,
        skip_fsync: bool,
    ) -> SmgrResult<()>;

    /// Advises the OS to start writing back a run of blocks. Pure hint;
    /// implementations may do nothing.
    fn writeback(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        first: BlockNumber,
        nblocks: usize,
    ) -> SmgrResult<()>;

    /// Hints that a block will be read soon. Returns true if an I/O was
    /// possibly initiated, false if the platform cannot prefetch.
    fn prefetch(&self, rel: RelFileLocator, fork: ForkNumber, block: BlockNumber) -> bool;

    /// Returns the current size of the fork in blocks.
    fn nblocks(&self, rel: RelFileLocator, fork: ForkNumber) -> SmgrResult<BlockNumber>;

    /// Returns the cached size of the fork, if one is known without
    /// consulting the filesystem.
    fn nblocks_cached(&self, rel: RelFileLocator, fork: ForkNumber) -> Option<BlockNumber>;
}
