//! Block addressing within a relation.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::BlockNumber;

/// Sentinel for "no such block".
pub const INVALID_BLOCK_NUMBER: BlockNumber = u32::MAX;

/// Largest block number a relation fork may contain.
pub const MAX_BLOCK_NUMBER: BlockNumber = u32::MAX - 1;

/// Legacy sentinel block number requesting relation extension: a read of
/// `P_NEW` allocates a fresh block at the end of the relation instead of
/// reading an existing one.
pub const P_NEW: BlockNumber = INVALID_BLOCK_NUMBER;

/// Fork number - names a sub-file of a relation.
///
/// Each relation is stored as a set of forks: the main data fork plus
/// auxiliary forks for free-space tracking, visibility information, and
/// the unlogged-relation init image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ForkNumber {
    /// Main data fork.
    Main = 0,
    /// Free space map fork.
    FreeSpaceMap = 1,
    /// Visibility map fork.
    VisibilityMap = 2,
    /// Init fork (the empty image an unlogged relation is reset to).
    Init = 3,
}

impl ForkNumber {
    /// All forks, in fork-number order.
    pub const ALL: [Self; 4] = [
        Self::Main,
        Self::FreeSpaceMap,
        Self::VisibilityMap,
        Self::Init,
    ];

    /// Creates a ForkNumber from a raw byte value.
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Main),
            1 => Some(Self::FreeSpaceMap),
            2 => Some(Self::VisibilityMap),
            3 => Some(Self::Init),
            _ => None,
        }
    }

    /// Returns the raw fork number.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ForkNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::FreeSpaceMap => write!(f, "fsm"),
            Self::VisibilityMap => write!(f, "vm"),
            Self::Init => write!(f, "init"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert_eq!(P_NEW, INVALID_BLOCK_NUMBER);
        assert!(MAX_BLOCK_NUMBER < INVALID_BLOCK_NUMBER);
    }

    #[test]
    fn test_fork_roundtrip() {
        for fork in ForkNumber::ALL {
            assert_eq!(ForkNumber::from_u8(fork.as_u8()), Some(fork));
        }
        assert_eq!(ForkNumber::from_u8(4), None);
    }

    #[test]
    fn test_fork_ordering() {
        assert!(ForkNumber::Main < ForkNumber::Init);
    }
}
