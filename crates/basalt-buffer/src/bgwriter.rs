//! Background writer: LRU-ahead cleaning.
//!
//! The background writer runs just ahead of the clock sweep, writing out
//! dirty buffers that are about to become eviction candidates so that
//! foreground sessions rarely have to flush on the victim path. Each
//! round samples the sweep's position and allocation counter, maintains
//! exponentially smoothed estimates of the allocation rate (fast attack,
//! slow decline) and of how many buffers must be scanned per reusable
//! buffer found, and cleans just enough to cover the next interval's
//! predicted demand.

use std::sync::Arc;

use crate::error::BufferResult;
use crate::pool::BufferManager;

/// Samples per smoothing window for the moving estimates.
const SMOOTHING_SAMPLES: f64 = 16.0;

/// Lap the whole pool at least this often (milliseconds), even when the
/// allocation estimate says nothing is happening.
const SCAN_WHOLE_POOL_MS: f64 = 120_000.0;

/// Cumulative background-writer statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BgWriterStats {
    /// Rounds executed.
    pub rounds: u64,
    /// Buffers examined across all rounds.
    pub buffers_scanned: u64,
    /// Buffers written across all rounds.
    pub buffers_written: u64,
    /// Rounds that hit the `bgwriter_lru_maxpages` write cap.
    pub maxwritten_stops: u64,
}

/// The background writer's persistent state between rounds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BgWriterState {
    saved_info_valid: bool,
    /// Where the cleaning scan will look next.
    next_to_clean: usize,
    /// Completed pool laps of the cleaning scan.
    next_passes: u64,
    /// Smoothed buffer allocations per round.
    smoothed_alloc: f64,
    /// Smoothed buffers scanned per reusable buffer found.
    smoothed_density: f64,
    stats: BgWriterStats,
}

impl BgWriterState {
    pub fn new() -> Self {
        Self {
            saved_info_valid: false,
            next_to_clean: 0,
            next_passes: 0,
            smoothed_alloc: 0.0,
            smoothed_density: 10.0,
            stats: BgWriterStats::default(),
        }
    }
}

impl BufferManager {
    /// Runs one background-writer round.
    ///
    /// Returns true when the pool is completely idle: the cleaning scan
    /// has lapped the allocation point and nothing was allocated since
    /// the last round, so the caller may sleep for longer than
    /// `bgwriter_delay`.
    pub fn bg_buffer_sync(&mut self) -> BufferResult<bool> {
        let pool = Arc::clone(&self.pool);
        let nbuffers = pool.nbuffers() as u64;
        let (strategy_buf_id, strategy_passes, recent_alloc) = pool.strategy().sync_start();

        let lru_maxpages = pool.config().bgwriter_lru_maxpages;
        if lru_maxpages == 0 {
            return Ok(true);
        }

        let mut st = self.bgwriter;
        st.stats.rounds += 1;

        if !st.saved_info_valid {
            st.next_to_clean = strategy_buf_id;
            st.next_passes = strategy_passes;
            st.saved_info_valid = true;
        }

        // Absolute positions let us compare across pool laps.
        let strategy_abs = strategy_passes * nbuffers + strategy_buf_id as u64;
        let mut clean_abs = st.next_passes * nbuffers + st.next_to_clean as u64;
        if clean_abs < strategy_abs {
            // The sweep overtook us; cleaning behind it is useless.
            st.next_to_clean = strategy_buf_id;
            st.next_passes = strategy_passes;
            clean_abs = strategy_abs;
        }
        let bufs_ahead = (clean_abs - strategy_abs).min(nbuffers) as usize;

        // Allocation estimate: jump up instantly, decay slowly.
        if st.smoothed_alloc <= recent_alloc as f64 {
            st.smoothed_alloc = recent_alloc as f64;
        } else {
            st.smoothed_alloc += (recent_alloc as f64 - st.smoothed_alloc) / SMOOTHING_SAMPLES;
        }

        // Reusable-buffer goal for this round: cover the predicted
        // allocations, but never scan slower than a full pool lap every
        // SCAN_WHOLE_POOL_MS.
        let delay = pool.config().bgwriter_delay_ms.max(1) as f64;
        let min_scan = ((nbuffers as f64) / (SCAN_WHOLE_POOL_MS / delay)).max(1.0) as usize;
        let upcoming = (st.smoothed_alloc * pool.config().bgwriter_lru_multiplier) as usize;
        let goal = upcoming.max(min_scan + bufs_ahead);

        let bgwriter_flush_after = if pool.config().io_direct_data() {
            0
        } else {
            pool.config().bgwriter_flush_after
        };
        self.writeback.set_flush_after(bgwriter_flush_after);

        let mut scanned = 0usize;
        let mut reusable = bufs_ahead;
        let mut written = 0usize;
        while reusable < goal && written < lru_maxpages && scanned < nbuffers as usize {
            let result = self.sync_one_buffer(st.next_to_clean, true);
            st.next_to_clean += 1;
            if st.next_to_clean >= nbuffers as usize {
                st.next_to_clean = 0;
                st.next_passes += 1;
            }
            scanned += 1;
            match result {
                Ok(sync) => {
                    if sync.written {
                        written += 1;
                    }
                    if sync.reusable {
                        reusable += 1;
                    }
                }
                Err(e) => {
                    self.bgwriter = st;
                    self.issue_pending_writebacks();
                    return Err(e);
                }
            }
        }
        self.issue_pending_writebacks();

        if written >= lru_maxpages {
            st.stats.maxwritten_stops += 1;
        }
        st.stats.buffers_scanned += scanned as u64;
        st.stats.buffers_written += written as u64;

        // Density estimate: how many buffers we had to look at per
        // reusable one found this round.
        let found = reusable.saturating_sub(bufs_ahead);
        if found > 0 {
            let density = scanned as f64 / found as f64;
            st.smoothed_density += (density - st.smoothed_density) / SMOOTHING_SAMPLES;
        }

        let hibernate_ok = recent_alloc == 0 && bufs_ahead >= nbuffers as usize;
        self.bgwriter = st;
        Ok(hibernate_ok)
    }

    /// Cumulative statistics of this session's background-writer rounds.
    pub fn bgwriter_stats(&self) -> BgWriterStats {
        self.bgwriter.stats
    }
}
