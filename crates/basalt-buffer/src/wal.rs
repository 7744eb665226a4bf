//! Write-ahead log interface.
//!
//! The buffer pool enforces the WAL-before-data rule but does not write
//! WAL itself; the four operations it needs are behind the [`WalLink`]
//! trait.

use basalt_common::types::Lsn;

use crate::error::BufferResult;

/// The WAL operations the buffer pool consumes.
pub trait WalLink: Send + Sync {
    /// Makes WAL durable up to and including `lsn`. Must not return
    /// until the flush is complete.
    fn flush_up_to(&self, lsn: Lsn) -> BufferResult<()>;

    /// Returns true if WAL up to `lsn` has not yet been made durable.
    fn needs_flush(&self, lsn: Lsn) -> bool;

    /// Emits a full-page image of `page` to guard a hint-bit update
    /// against torn writes. Returns the record's LSN.
    fn log_full_page(&self, page: &[u8]) -> BufferResult<Lsn>;

    /// Returns true while the system is replaying WAL.
    fn is_recovery(&self) -> bool;

    /// Marks the calling session as one a concurrent checkpoint must not
    /// complete ahead of. Bracketed with [`WalLink::end_delay_checkpoint`]
    /// around the full-page-image emission in a hint-bit update.
    fn begin_delay_checkpoint(&self) {}

    /// Ends the checkpoint-start delay bracket.
    fn end_delay_checkpoint(&self) {}
}
