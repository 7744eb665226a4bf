//! Buffer pool errors.

use std::io;

use basalt_common::types::BlockNumber;
use thiserror::Error;

use crate::smgr::RelFileLocator;
use crate::Buffer;

/// Result type for buffer pool operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors that can occur during buffer pool operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum BufferError {
    /// A handle failed its validity check.
    #[error("bad buffer handle: {buffer:?}")]
    BadBufferId { buffer: Buffer },

    /// Page verification failed and the read mode disallows zeroing.
    #[error("invalid page in block {block} of relation {rel} fork {fork}")]
    CorruptPage {
        rel: RelFileLocator,
        fork: basalt_common::types::ForkNumber,
        block: BlockNumber,
    },

    /// A pre-existing non-zero buffer was found while extending a relation.
    #[error("unexpected data beyond EOF in block {block} of relation {rel}")]
    UnexpectedDataBeyondEof {
        rel: RelFileLocator,
        block: BlockNumber,
    },

    /// The storage manager failed to write a block; the buffer stays dirty.
    #[error("could not write block {block} of relation {rel}: {source}")]
    WriteError {
        rel: RelFileLocator,
        block: BlockNumber,
        source: io::Error,
    },

    /// The WAL flush preceding a page write failed; the flush was aborted.
    #[error("could not flush WAL up to {lsn}: {message}")]
    WalFlushError {
        lsn: basalt_common::types::Lsn,
        message: String,
    },

    /// Two cleanup-lock waiters on one buffer (programming error).
    #[error("multiple backends attempting to wait for pincount 1 on buffer {buffer:?}")]
    ConcurrentPinCountWaiters { buffer: Buffer },

    /// Extension would push the relation past the largest block number.
    #[error("cannot extend relation {rel} beyond {max} blocks")]
    RelationTooLarge { rel: RelFileLocator, max: BlockNumber },

    /// The clock sweep completed a full pass without a candidate.
    #[error("no unpinned buffers available")]
    NoUnpinnedBuffersAvailable,

    /// Attempt to access another session's temporary relation.
    #[error("cannot access temporary tables of other sessions")]
    TempTableAccessForbidden,

    /// The old-snapshot check hook rejected the read.
    #[error("snapshot too old")]
    SnapshotTooOld,

    /// I/O error outside a block write.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl BufferError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a transient error that can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoUnpinnedBuffersAvailable | Self::WalFlushError { .. } | Self::WriteError { .. }
        )
    }

    /// Returns true if this indicates on-disk damage rather than a
    /// transient condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CorruptPage { .. } | Self::UnexpectedDataBeyondEof { .. }
        )
    }
}
