//! Buffer pool configuration.

use basalt_common::constants::{
    DEFAULT_BACKEND_FLUSH_AFTER, DEFAULT_BGWRITER_DELAY_MS, DEFAULT_BGWRITER_FLUSH_AFTER,
    DEFAULT_BGWRITER_LRU_MAXPAGES, DEFAULT_BGWRITER_LRU_MULTIPLIER,
    DEFAULT_CHECKPOINT_COMPLETION_TARGET, DEFAULT_CHECKPOINT_FLUSH_AFTER,
    DEFAULT_DEADLOCK_TIMEOUT_MS, DEFAULT_SHARED_BUFFERS, MIN_SHARED_BUFFERS,
    NUM_BUFFER_PARTITIONS,
};

/// Direct-I/O flag bit: data files bypass the kernel page cache.
///
/// When set, prefetch and writeback hints are suppressed since the kernel
/// has nothing useful to do with them.
pub const IO_DIRECT_DATA: u32 = 1 << 0;

/// Configuration for the shared buffer pool.
///
/// Built with chainable setters and validated once at pool creation;
/// every option is fixed for the lifetime of the pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of shared buffers (pool slots).
    pub shared_buffers: usize,
    /// Number of partitions in the buffer mapping table.
    pub mapping_partitions: usize,
    /// Upper bound on the number of sessions; used to derive the
    /// per-backend pin budget for bulk extension.
    pub max_backends: usize,
    /// Upper bound on buffers written per bgwriter LRU round
    /// (0 disables the scan).
    pub bgwriter_lru_maxpages: usize,
    /// Multiplier applied to the smoothed allocation estimate when
    /// sizing a bgwriter round.
    pub bgwriter_lru_multiplier: f64,
    /// Delay between bgwriter rounds, in milliseconds.
    pub bgwriter_delay_ms: u64,
    /// Blocks written by a checkpoint before a coalesced writeback is
    /// issued (0 disables).
    pub checkpoint_flush_after: usize,
    /// Writeback threshold for the background writer (0 disables).
    pub bgwriter_flush_after: usize,
    /// Writeback threshold for ordinary backends (0 disables).
    pub backend_flush_after: usize,
    /// Fraction of the checkpoint interval to spread writes over.
    pub checkpoint_completion_target: f64,
    /// Prefetch depth for ordinary reads.
    pub effective_io_concurrency: usize,
    /// Prefetch depth for maintenance operations.
    pub maintenance_io_concurrency: usize,
    /// Zero out damaged pages instead of failing the read.
    pub zero_damaged_pages: bool,
    /// Record time spent in block reads and writes.
    pub track_io_timing: bool,
    /// Direct-I/O flag bits (see [`IO_DIRECT_DATA`]).
    pub io_direct_flags: u32,
    /// Verify checksums on read and stamp them on write.
    pub checksums_enabled: bool,
    /// How long a recovery cleanup-waiter sleeps before reporting a
    /// conflict, in milliseconds.
    pub deadlock_timeout_ms: u64,
}

impl BufferPoolConfig {
    /// Creates a new configuration with the specified pool size.
    pub fn new(shared_buffers: usize) -> Self {
        Self {
            shared_buffers,
            mapping_partitions: NUM_BUFFER_PARTITIONS,
            max_backends: 64,
            bgwriter_lru_maxpages: DEFAULT_BGWRITER_LRU_MAXPAGES,
            bgwriter_lru_multiplier: DEFAULT_BGWRITER_LRU_MULTIPLIER,
            bgwriter_delay_ms: DEFAULT_BGWRITER_DELAY_MS,
            checkpoint_flush_after: DEFAULT_CHECKPOINT_FLUSH_AFTER,
            bgwriter_flush_after: DEFAULT_BGWRITER_FLUSH_AFTER,
            backend_flush_after: DEFAULT_BACKEND_FLUSH_AFTER,
            checkpoint_completion_target: DEFAULT_CHECKPOINT_COMPLETION_TARGET,
            effective_io_concurrency: 1,
            maintenance_io_concurrency: 10,
            zero_damaged_pages: false,
            track_io_timing: false,
            io_direct_flags: 0,
            checksums_enabled: true,
            deadlock_timeout_ms: DEFAULT_DEADLOCK_TIMEOUT_MS,
        }
    }

    /// Sets the number of mapping partitions.
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.mapping_partitions = partitions;
        self
    }

    /// Sets the backend limit used for pin budgeting.
    pub fn with_max_backends(mut self, max_backends: usize) -> Self {
        self.max_backends = max_backends;
        self
    }

    /// Enables or disables page checksums.
    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.checksums_enabled = enabled;
        self
    }

    /// Sets the damaged-page policy.
    pub fn with_zero_damaged_pages(mut self, enabled: bool) -> Self {
        self.zero_damaged_pages = enabled;
        self
    }

    /// Sets the bgwriter LRU page cap.
    pub fn with_bgwriter_lru_maxpages(mut self, maxpages: usize) -> Self {
        self.bgwriter_lru_maxpages = maxpages;
        self
    }

    /// Sets the bgwriter allocation multiplier.
    pub fn with_bgwriter_lru_multiplier(mut self, multiplier: f64) -> Self {
        self.bgwriter_lru_multiplier = multiplier;
        self
    }

    /// Sets the per-consumer writeback thresholds.
    pub fn with_flush_after(
        mut self,
        checkpoint: usize,
        bgwriter: usize,
        backend: usize,
    ) -> Self {
        self.checkpoint_flush_after = checkpoint;
        self.bgwriter_flush_after = bgwriter;
        self.backend_flush_after = backend;
        self
    }

    /// Enables or disables I/O timing collection.
    pub fn with_track_io_timing(mut self, enabled: bool) -> Self {
        self.track_io_timing = enabled;
        self
    }

    /// Sets direct-I/O flag bits.
    pub fn with_io_direct_flags(mut self, flags: u32) -> Self {
        self.io_direct_flags = flags;
        self
    }

    /// Returns true if prefetch and writeback hints should be suppressed.
    #[inline]
    pub fn io_direct_data(&self) -> bool {
        self.io_direct_flags & IO_DIRECT_DATA != 0
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.shared_buffers < MIN_SHARED_BUFFERS {
            return Err("shared_buffers below minimum");
        }
        if self.mapping_partitions == 0 || !self.mapping_partitions.is_power_of_two() {
            return Err("mapping_partitions must be a nonzero power of 2");
        }
        if self.max_backends == 0 {
            return Err("max_backends must be > 0");
        }
        if !(0.0..=1.0).contains(&self.checkpoint_completion_target) {
            return Err("checkpoint_completion_target must be in [0, 1]");
        }
        if self.bgwriter_lru_multiplier < 0.0 {
            return Err("bgwriter_lru_multiplier must be >= 0");
        }
        Ok(())
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SHARED_BUFFERS)
    }
}
