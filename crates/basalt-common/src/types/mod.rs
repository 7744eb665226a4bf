//! Core types for BasaltDB.
//!
//! This module provides the fundamental types used throughout the system:
//! object identifiers, block addressing, and log sequence numbers.

mod block;
mod ids;

pub use block::{
    ForkNumber, INVALID_BLOCK_NUMBER, MAX_BLOCK_NUMBER, P_NEW,
};
pub use ids::{BackendId, DatabaseId, Lsn, RelationId, TablespaceId};

/// Block number within a relation fork.
///
/// Plain `u32` rather than a newtype: block numbers are arithmetic-heavy
/// (extension, run fusion, size clamping) and the sentinels below mark
/// the reserved values.
pub type BlockNumber = u32;
