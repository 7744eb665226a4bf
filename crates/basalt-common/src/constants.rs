//! System-wide constants for BasaltDB.
//!
//! This module defines constants used across the database.

// =============================================================================
// Page and Memory Constants
// =============================================================================

/// Size of a disk block in bytes (8 KB).
///
/// Every buffer in the shared pool holds exactly one block of this size.
/// It matches the typical SSD block size and OS page size.
pub const BLCKSZ: usize = 8 * 1024;

/// Default number of shared buffers (128 MB worth of pages).
pub const DEFAULT_SHARED_BUFFERS: usize = 16 * 1024;

/// Minimum number of shared buffers a pool may be configured with.
pub const MIN_SHARED_BUFFERS: usize = 16;

// =============================================================================
// Buffer Mapping Constants
// =============================================================================

/// Number of partitions in the buffer mapping table.
///
/// Each partition is guarded by an independent reader/writer lock so
/// lookups on unrelated pages never contend.
pub const NUM_BUFFER_PARTITIONS: usize = 128;

// =============================================================================
// Replacement Policy Constants
// =============================================================================

/// Maximum usage count a buffer can accumulate.
///
/// The clock sweep decrements the usage count on each pass; a buffer must
/// be passed over this many times before it becomes an eviction candidate.
pub const MAX_USAGE_COUNT: u32 = 5;

/// Ring size for sequential-scan access strategies (256 KB of buffers).
pub const BULKREAD_RING_SIZE: usize = 256 * 1024 / BLCKSZ;

/// Ring size for bulk-write access strategies (16 MB of buffers).
pub const BULKWRITE_RING_SIZE: usize = 16 * 1024 * 1024 / BLCKSZ;

/// Ring size for vacuum access strategies (256 KB of buffers).
pub const VACUUM_RING_SIZE: usize = 256 * 1024 / BLCKSZ;

// =============================================================================
// Pin Tracking Constants
// =============================================================================

/// Number of entries in the fast-path private refcount array.
///
/// Most backends hold only a handful of pins at once; entries beyond this
/// spill into an overflow hash map.
pub const PRIVATE_REFCOUNT_ARRAY_SIZE: usize = 8;

// =============================================================================
// Writeback Constants
// =============================================================================

/// Hard cap on the number of pending writeback requests a single context
/// may accumulate before it must issue them.
pub const WRITEBACK_MAX_PENDING: usize = 256;

// =============================================================================
// Background Writer Constants
// =============================================================================

/// Default upper bound on buffers written per bgwriter round.
pub const DEFAULT_BGWRITER_LRU_MAXPAGES: usize = 100;

/// Default multiplier applied to the smoothed allocation estimate.
pub const DEFAULT_BGWRITER_LRU_MULTIPLIER: f64 = 2.0;

/// Default delay between bgwriter rounds, in milliseconds.
pub const DEFAULT_BGWRITER_DELAY_MS: u64 = 200;

// =============================================================================
// Checkpoint Constants
// =============================================================================

/// Default fraction of the checkpoint interval to spread writes over.
pub const DEFAULT_CHECKPOINT_COMPLETION_TARGET: f64 = 0.9;

/// Default number of blocks written before a coalesced writeback request
/// is issued on behalf of the checkpointer (0 disables).
pub const DEFAULT_CHECKPOINT_FLUSH_AFTER: usize = 32;

/// Default writeback threshold for the background writer.
pub const DEFAULT_BGWRITER_FLUSH_AFTER: usize = 64;

/// Default writeback threshold for ordinary backends (0 disables).
pub const DEFAULT_BACKEND_FLUSH_AFTER: usize = 0;

// =============================================================================
// Bulk Invalidation Constants
// =============================================================================

/// A relation drop smaller than `shared_buffers / BUF_DROP_SCAN_DIVISOR`
/// blocks uses targeted mapping lookups instead of a full table scan.
pub const BUF_DROP_SCAN_DIVISOR: usize = 32;

/// Relation lists longer than this are sorted and binary-searched during
/// bulk drop/flush scans; shorter lists use a linear match.
pub const RELS_BSEARCH_THRESHOLD: usize = 20;

// =============================================================================
// Timeouts
// =============================================================================

/// Default deadlock timeout used for recovery-conflict reporting, in
/// milliseconds.
pub const DEFAULT_DEADLOCK_TIMEOUT_MS: u64 = 1_000;
