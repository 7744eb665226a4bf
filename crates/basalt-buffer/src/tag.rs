//! Buffer tags: the identity of a cached block.

use std::fmt;
use std::hash::{Hash, Hasher};

use basalt_common::types::{BlockNumber, ForkNumber, INVALID_BLOCK_NUMBER};
use siphasher::sip::SipHasher13;

use crate::smgr::RelFileLocator;

// Fixed keys so tag hashes (and therefore partition assignment) are
// stable across runs and across backends.
const TAG_HASH_K0: u64 = 0x7465_6c6c_7572_6974;
const TAG_HASH_K1: u64 = 0x6261_7361_6c74_6462;

/// Identity of a cached block: which relation fork it belongs to and
/// which block it is.
///
/// Ordered by `(tablespace, database, relation, fork, block)` so sorting
/// a set of tags groups them by tablespace and makes per-file runs
/// consecutive.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferTag {
    /// Physical address of the relation.
    pub rel: RelFileLocator,
    /// Which fork of the relation.
    pub fork: ForkNumber,
    /// Block number within the fork.
    pub block: BlockNumber,
}

impl BufferTag {
    /// The cleared tag stored in descriptors that cache nothing.
    pub const INVALID: Self = Self {
        rel: RelFileLocator {
            tablespace: basalt_common::types::TablespaceId::INVALID,
            database: basalt_common::types::DatabaseId::INVALID,
            relation: basalt_common::types::RelationId::INVALID,
        },
        fork: ForkNumber::Main,
        block: INVALID_BLOCK_NUMBER,
    };

    /// Creates a tag for a block of a relation fork.
    #[inline]
    #[must_use]
    pub const fn new(rel: RelFileLocator, fork: ForkNumber, block: BlockNumber) -> Self {
        Self { rel, fork, block }
    }

    /// Returns true if this tag names an actual block.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.rel.relation.is_valid()
    }

    /// Stable hash of the tag, used for mapping-partition selection.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(TAG_HASH_K0, TAG_HASH_K1);
        self.rel.tablespace.as_u32().hash(&mut hasher);
        self.rel.database.as_u32().hash(&mut hasher);
        self.rel.relation.as_u32().hash(&mut hasher);
        self.fork.as_u8().hash(&mut hasher);
        self.block.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for BufferTag {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferTag({}/{}/{})", self.rel, self.fork, self.block)
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.rel, self.fork, self.block)
    }
}
