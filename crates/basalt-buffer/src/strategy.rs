//! Buffer replacement: free list, clock sweep, and ring strategies.
//!
//! Victim selection runs in three tiers. A ring strategy, if the caller
//! carries one, recycles the caller's own recent buffers to cap the cache
//! footprint of bulk scans. The free list hands out buffers that are
//! known to cache nothing. Everything else falls to the clock sweep: a
//! rotating hand that decays usage counts until it finds a buffer nobody
//! has pinned or used lately.

use std::sync::atomic::{AtomicU64, Ordering};

use basalt_common::constants::{BULKREAD_RING_SIZE, BULKWRITE_RING_SIZE, VACUUM_RING_SIZE};
use parking_lot::Mutex;

use crate::descriptor::BufferDesc;
use crate::error::{BufferError, BufferResult};
use crate::state::{StateGuard, BM_TAG_VALID};

/// Freelist link value: not a member of the list.
const FREENEXT_NOT_IN_LIST: i64 = -2;
/// Freelist link value: member, end of list.
const FREENEXT_END_OF_LIST: i64 = -1;

/// Shared replacement state: the clock hand, the free list, and the
/// counters the background writer samples.
pub(crate) struct StrategyControl {
    nbuffers: usize,
    /// Monotonic victim counter; position is `counter % nbuffers` and
    /// completed passes are `counter / nbuffers`.
    next_victim: AtomicU64,
    /// Buffers handed out since the last bgwriter sample.
    num_buffer_allocs: AtomicU64,
    freelist: Mutex<FreeList>,
}

struct FreeList {
    head: i64,
    next: Vec<i64>,
}

impl StrategyControl {
    /// Creates the strategy state with every buffer on the free list.
    pub fn new(nbuffers: usize) -> Self {
        let mut next: Vec<i64> = (0..nbuffers).map(|i| i as i64 + 1).collect();
        if let Some(last) = next.last_mut() {
            *last = FREENEXT_END_OF_LIST;
        }
        Self {
            nbuffers,
            next_victim: AtomicU64::new(0),
            num_buffer_allocs: AtomicU64::new(0),
            freelist: Mutex::new(FreeList {
                head: if nbuffers == 0 { FREENEXT_END_OF_LIST } else { 0 },
                next,
            }),
        }
    }

    /// Advances the clock hand one position.
    #[inline]
    fn clock_tick(&self) -> usize {
        (self.next_victim.fetch_add(1, Ordering::Relaxed) % self.nbuffers as u64) as usize
    }

    /// Selects a victim buffer.
    ///
    /// On success the buffer's header lock is held and the caller must
    /// complete the pin before releasing it. The returned buffer has
    /// refcount 0 and usage count 0; it may still carry a valid tag and
    /// dirty data, which the caller flushes and invalidates.
    pub fn get_victim<'a>(
        &self,
        descriptors: &'a [BufferDesc],
        mut strategy: Option<&mut AccessStrategy>,
    ) -> BufferResult<(usize, StateGuard<'a>)> {
        self.num_buffer_allocs.fetch_add(1, Ordering::Relaxed);

        // Tier 1: the caller's ring.
        if let Some(s) = strategy.as_deref_mut() {
            if let Some((buf_id, guard)) = s.ring_candidate(descriptors) {
                return Ok((buf_id, guard));
            }
        }

        // Tier 2: the free list.
        while let Some(buf_id) = self.freelist_pop() {
            let guard = descriptors[buf_id].state().lock();
            // A freelisted buffer can have been handed out and reused
            // since it was pushed; only a quiescent one is usable.
            if guard.state.refcount() == 0
                && guard.state.usage_count() == 0
                && !guard.state.has(BM_TAG_VALID)
            {
                if let Some(s) = strategy.as_deref_mut() {
                    s.adopt(buf_id);
                }
                return Ok((buf_id, guard));
            }
        }

        // Tier 3: the clock sweep.
        let mut trycounter = self.nbuffers;
        loop {
            let buf_id = self.clock_tick();
            let mut guard = descriptors[buf_id].state().lock();

            if guard.state.refcount() == 0 {
                if guard.state.usage_count() > 0 {
                    guard.state = guard.state.decay_usage();
                    trycounter = self.nbuffers;
                } else {
                    if let Some(s) = strategy.as_deref_mut() {
                        s.adopt(buf_id);
                    }
                    return Ok((buf_id, guard));
                }
            } else {
                trycounter -= 1;
                if trycounter == 0 {
                    // Every buffer is pinned: a full pass found nothing.
                    drop(guard);
                    return Err(BufferError::NoUnpinnedBuffersAvailable);
                }
            }
        }
    }

    /// Returns an invalidated buffer to the free list.
    pub fn free_buffer(&self, buf_id: usize) {
        let mut freelist = self.freelist.lock();
        if freelist.next[buf_id] == FREENEXT_NOT_IN_LIST {
            freelist.next[buf_id] = freelist.head;
            freelist.head = buf_id as i64;
        }
    }

    /// Samples the clock position for the background writer: returns the
    /// current hand position, the number of completed passes, and the
    /// allocation count since the previous sample (which is reset).
    pub fn sync_start(&self) -> (usize, u64, u64) {
        let counter = self.next_victim.load(Ordering::Relaxed);
        let position = (counter % self.nbuffers as u64) as usize;
        let passes = counter / self.nbuffers as u64;
        let allocs = self.num_buffer_allocs.swap(0, Ordering::Relaxed);
        (position, passes, allocs)
    }

    fn freelist_pop(&self) -> Option<usize> {
        let mut freelist = self.freelist.lock();
        if freelist.head < 0 {
            return None;
        }
        let buf_id = freelist.head as usize;
        freelist.head = freelist.next[buf_id];
        freelist.next[buf_id] = FREENEXT_NOT_IN_LIST;
        Some(buf_id)
    }
}

/// Which bulk operation a ring strategy serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStrategyKind {
    /// Large sequential read (ring ≈ 256 KB).
    BulkRead,
    /// Large sequential write, e.g. a table rewrite (ring ≈ 16 MB).
    BulkWrite,
    /// Vacuum-style read-modify scan (ring ≈ 256 KB).
    Vacuum,
}

impl AccessStrategyKind {
    fn ring_size(self) -> usize {
        match self {
            Self::BulkRead => BULKREAD_RING_SIZE,
            Self::BulkWrite => BULKWRITE_RING_SIZE,
            Self::Vacuum => VACUUM_RING_SIZE,
        }
    }

    /// Whether this strategy gives up a dirty ring buffer rather than
    /// stall on a synchronous WAL flush.
    fn rejects_wal_flush(self) -> bool {
        // Bulk writers generate the WAL they would wait on anyway.
        !matches!(self, Self::BulkWrite)
    }
}

/// A bounded ring of buffers private to one bulk scan.
///
/// Each victim request first offers the ring slot the hand points at; a
/// slot whose buffer has been claimed by someone else (pinned or touched)
/// silently falls through to the shared sweep and the replacement buffer
/// is adopted into the slot.
pub struct AccessStrategy {
    kind: AccessStrategyKind,
    ring: Vec<Option<usize>>,
    current: usize,
    /// Whether the most recent victim came out of the ring (rather than
    /// being adopted from the shared sweep).
    current_was_in_ring: bool,
}

impl AccessStrategy {
    /// Creates a strategy with the default ring size for `kind`.
    #[must_use]
    pub fn new(kind: AccessStrategyKind) -> Self {
        Self::with_ring_size(kind, kind.ring_size())
    }

    /// Creates a strategy with an explicit ring size (minimum 1).
    #[must_use]
    pub fn with_ring_size(kind: AccessStrategyKind, size: usize) -> Self {
        Self {
            kind,
            ring: vec![None; size.max(1)],
            current: 0,
            current_was_in_ring: false,
        }
    }

    /// Returns the strategy kind.
    #[must_use]
    pub fn kind(&self) -> AccessStrategyKind {
        self.kind
    }

    /// Offers the next ring buffer as a victim, if it is still this
    /// strategy's to reuse.
    fn ring_candidate<'a>(
        &mut self,
        descriptors: &'a [BufferDesc],
    ) -> Option<(usize, StateGuard<'a>)> {
        self.current = (self.current + 1) % self.ring.len();
        self.current_was_in_ring = false;

        let buf_id = self.ring[self.current]?;
        let guard = descriptors[buf_id].state().lock();
        // Reusable only if nobody else adopted it: unpinned and touched
        // at most by our own 1-pin policy.
        if guard.state.refcount() == 0 && guard.state.usage_count() <= 1 {
            self.current_was_in_ring = true;
            Some((buf_id, guard))
        } else {
            None
        }
    }

    /// Installs a sweep-won buffer into the current ring slot.
    fn adopt(&mut self, buf_id: usize) {
        self.ring[self.current] = Some(buf_id);
        self.current_was_in_ring = false;
    }

    /// Asks the strategy to give up the current ring buffer because
    /// evicting it would force a WAL flush. Returns true if the buffer
    /// was dropped from the ring and the caller should pick another
    /// victim from the shared sweep.
    pub(crate) fn reject_current(&mut self) -> bool {
        if !self.current_was_in_ring || !self.kind.rejects_wal_flush() {
            return false;
        }
        self.ring[self.current] = None;
        self.current_was_in_ring = false;
        true
    }

    /// True if the most recent victim came from the ring.
    pub(crate) fn current_was_in_ring(&self) -> bool {
        self.current_was_in_ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_common::constants::BLCKSZ;

    fn descriptors(n: usize) -> Vec<BufferDesc> {
        (0..n).map(|i| BufferDesc::new(i, BLCKSZ)).collect()
    }

    #[test]
    fn test_freelist_hands_out_every_buffer() {
        let descs = descriptors(4);
        let control = StrategyControl::new(4);

        let mut seen = Vec::new();
        for _ in 0..4 {
            let (buf_id, guard) = control.get_victim(&descs, None).unwrap();
            guard.unlock();
            seen.push(buf_id);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_sweep_decays_usage_counts() {
        let descs = descriptors(2);
        let control = StrategyControl::new(2);

        // Drain the freelist, then mark both buffers as recently used.
        for _ in 0..2 {
            let (_, guard) = control.get_victim(&descs, None).unwrap();
            guard.unlock();
        }
        for desc in &descs {
            let mut guard = desc.state().lock();
            guard.state = guard.state.with_usage(2);
        }

        let (buf_id, guard) = control.get_victim(&descs, None).unwrap();
        assert_eq!(guard.state.usage_count(), 0);
        guard.unlock();
        // Both buffers had equal usage; the hand settles on some buffer
        // only after decaying each to zero.
        let other = 1 - buf_id;
        assert!(descs[other].state().load().usage_count() <= 2);
    }

    #[test]
    fn test_all_pinned_errors() {
        let descs = descriptors(2);
        let control = StrategyControl::new(2);

        for desc in &descs {
            let mut guard = desc.state().lock();
            guard.state = guard.state.add_ref();
        }

        let err = control.get_victim(&descs, None).unwrap_err();
        assert!(matches!(err, BufferError::NoUnpinnedBuffersAvailable));
    }

    #[test]
    fn test_free_buffer_is_reissued() {
        let descs = descriptors(2);
        let control = StrategyControl::new(2);
        for _ in 0..2 {
            let (_, guard) = control.get_victim(&descs, None).unwrap();
            guard.unlock();
        }

        control.free_buffer(1);
        let (buf_id, guard) = control.get_victim(&descs, None).unwrap();
        guard.unlock();
        assert_eq!(buf_id, 1);
    }

    #[test]
    fn test_ring_adopts_and_recycles() {
        let descs = descriptors(8);
        let control = StrategyControl::new(8);
        let mut strategy = AccessStrategy::with_ring_size(AccessStrategyKind::BulkRead, 2);

        let (first, guard) = control.get_victim(&descs, Some(&mut strategy)).unwrap();
        assert!(!strategy.current_was_in_ring());
        guard.unlock();
        let (second, guard) = control.get_victim(&descs, Some(&mut strategy)).unwrap();
        guard.unlock();
        assert_ne!(first, second);

        // Third request wraps the two-slot ring and reuses the first
        // buffer, which is still unpinned and unused.
        let (third, guard) = control.get_victim(&descs, Some(&mut strategy)).unwrap();
        assert!(strategy.current_was_in_ring());
        guard.unlock();
        assert_eq!(third, first);
    }

    #[test]
    fn test_ring_skips_stolen_buffer() {
        let descs = descriptors(8);
        let control = StrategyControl::new(8);
        let mut strategy = AccessStrategy::with_ring_size(AccessStrategyKind::BulkRead, 1);

        let (first, guard) = control.get_victim(&descs, Some(&mut strategy)).unwrap();
        guard.unlock();

        // Another session pins the ring buffer.
        {
            let mut guard = descs[first].state().lock();
            guard.state = guard.state.add_ref();
        }

        let (second, guard) = control.get_victim(&descs, Some(&mut strategy)).unwrap();
        guard.unlock();
        assert_ne!(second, first);
    }

    #[test]
    fn test_reject_only_applies_to_ring_buffers() {
        let mut strategy = AccessStrategy::with_ring_size(AccessStrategyKind::BulkRead, 2);
        assert!(!strategy.reject_current(), "nothing from the ring yet");

        let mut bulk_write = AccessStrategy::with_ring_size(AccessStrategyKind::BulkWrite, 2);
        bulk_write.current_was_in_ring = true;
        assert!(!bulk_write.reject_current(), "bulk writers keep their buffers");

        strategy.ring[0] = Some(5);
        strategy.current = 0;
        strategy.current_was_in_ring = true;
        assert!(strategy.reject_current());
        assert_eq!(strategy.ring[0], None);
    }

    #[test]
    fn test_sync_start_reports_allocs() {
        let descs = descriptors(4);
        let control = StrategyControl::new(4);
        for _ in 0..3 {
            let (_, guard) = control.get_victim(&descs, None).unwrap();
            guard.unlock();
        }
        let (_, _, allocs) = control.sync_start();
        assert_eq!(allocs, 3);
        let (_, _, allocs) = control.sync_start();
        assert_eq!(allocs, 0);
    }
}
