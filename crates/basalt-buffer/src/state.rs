//! Packed buffer state word.
//!
//! Each descriptor's bookkeeping lives in one 32-bit atomic so a pin can
//! increment the refcount and observe the flag bits in a single
//! compare-and-swap:
//!
//! ```text
//! Bits  0..18  refcount (number of sessions holding a pin)
//! Bits 18..22  usage count (clock-sweep popularity, capped at 5)
//! Bits 22..32  flag bits (see the `BM_*` constants)
//! ```
//!
//! The `BM_LOCKED` flag doubles as a micro-spinlock (the "header lock"):
//! transitions that must also touch non-atomic descriptor fields (the
//! tag, the cleanup-waiter id) take it via [`BufStateCell::lock`]. Held
//! durations are bounded: no I/O, no allocation, no blocking while the
//! flag is set.

use std::sync::atomic::{AtomicU32, Ordering};

use basalt_common::constants::MAX_USAGE_COUNT;

/// Number of bits reserved for the shared refcount.
pub const BUF_REFCOUNT_BITS: u32 = 18;
/// Number of bits reserved for the usage count.
pub const BUF_USAGECOUNT_BITS: u32 = 4;

const REFCOUNT_MASK: u32 = (1 << BUF_REFCOUNT_BITS) - 1;
const USAGE_SHIFT: u32 = BUF_REFCOUNT_BITS;
const USAGE_MASK: u32 = ((1 << BUF_USAGECOUNT_BITS) - 1) << USAGE_SHIFT;

/// Header spinlock; guards non-atomic descriptor fields.
pub const BM_LOCKED: u32 = 1 << 22;
/// Page bytes differ from the on-disk version.
pub const BM_DIRTY: u32 = 1 << 23;
/// Page bytes are a faithful copy of the tagged block.
pub const BM_VALID: u32 = 1 << 24;
/// The tag field names a block (the descriptor is in the mapping).
pub const BM_TAG_VALID: u32 = 1 << 25;
/// One session is reading or writing this buffer.
pub const BM_IO_IN_PROGRESS: u32 = 1 << 26;
/// The previous I/O on this buffer failed.
pub const BM_IO_ERROR: u32 = 1 << 27;
/// Dirtied again since the in-flight write captured the page.
pub const BM_JUST_DIRTIED: u32 = 1 << 28;
/// A session is waiting for the pin count to drop to one.
pub const BM_PIN_COUNT_WAITER: u32 = 1 << 29;
/// The current checkpoint must write this buffer.
pub const BM_CHECKPOINT_NEEDED: u32 = 1 << 30;
/// Belongs to a WAL-logged fork (survives crashes).
pub const BM_PERMANENT: u32 = 1 << 31;

/// Flag bits cleared when a descriptor is invalidated and returned to
/// the free pool. `BM_LOCKED` is preserved because the caller still
/// holds the header lock at that point.
pub const BM_INVALIDATE_CLEAR: u32 = BM_DIRTY
    | BM_VALID
    | BM_TAG_VALID
    | BM_IO_ERROR
    | BM_JUST_DIRTIED
    | BM_CHECKPOINT_NEEDED
    | BM_PERMANENT;

/// A decoded snapshot of the state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufState(pub u32);

impl BufState {
    /// Returns the shared refcount.
    #[inline]
    #[must_use]
    pub const fn refcount(self) -> u32 {
        self.0 & REFCOUNT_MASK
    }

    /// Returns the usage count.
    #[inline]
    #[must_use]
    pub const fn usage_count(self) -> u32 {
        (self.0 & USAGE_MASK) >> USAGE_SHIFT
    }

    /// Returns true if every flag in `flags` is set.
    #[inline]
    #[must_use]
    pub const fn has(self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    /// Returns true if any flag in `flags` is set.
    #[inline]
    #[must_use]
    pub const fn has_any(self, flags: u32) -> bool {
        self.0 & flags != 0
    }

    /// Returns the state with the refcount incremented.
    #[inline]
    #[must_use]
    pub const fn add_ref(self) -> Self {
        debug_assert!(self.refcount() < REFCOUNT_MASK);
        Self(self.0 + 1)
    }

    /// Returns the state with the refcount decremented.
    #[inline]
    #[must_use]
    pub const fn sub_ref(self) -> Self {
        debug_assert!(self.refcount() > 0);
        Self(self.0 - 1)
    }

    /// Returns the state with the usage count set to `count`.
    #[inline]
    #[must_use]
    pub const fn with_usage(self, count: u32) -> Self {
        Self((self.0 & !USAGE_MASK) | ((count << USAGE_SHIFT) & USAGE_MASK))
    }

    /// Returns the state with the usage count bumped, saturating at
    /// [`MAX_USAGE_COUNT`].
    #[inline]
    #[must_use]
    pub const fn bump_usage(self) -> Self {
        if self.usage_count() < MAX_USAGE_COUNT {
            Self(self.0 + (1 << USAGE_SHIFT))
        } else {
            self
        }
    }

    /// Returns the state with the usage count decremented (must be > 0).
    #[inline]
    #[must_use]
    pub const fn decay_usage(self) -> Self {
        debug_assert!(self.usage_count() > 0);
        Self(self.0 - (1 << USAGE_SHIFT))
    }

    /// Returns the state with `flags` set.
    #[inline]
    #[must_use]
    pub const fn set(self, flags: u32) -> Self {
        Self(self.0 | flags)
    }

    /// Returns the state with `flags` cleared.
    #[inline]
    #[must_use]
    pub const fn clear(self, flags: u32) -> Self {
        Self(self.0 & !flags)
    }
}

/// The atomic cell holding a descriptor's state word.
#[derive(Debug)]
pub struct BufStateCell(AtomicU32);

impl BufStateCell {
    /// Creates a zeroed state cell.
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Reads the current state.
    #[inline]
    pub fn load(&self) -> BufState {
        BufState(self.0.load(Ordering::Acquire))
    }

    /// Single compare-and-swap; on failure returns the observed state.
    #[inline]
    pub fn cas(&self, old: BufState, new: BufState) -> Result<(), BufState> {
        self.0
            .compare_exchange_weak(old.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(BufState)
    }

    /// Spins until the header lock is not held, returning the last
    /// observed state. Used by CAS loops that must not run while a
    /// header-locked transition is in flight.
    #[inline]
    pub fn wait_unlocked(&self) -> BufState {
        let mut delay = SpinDelay::new();
        loop {
            let state = BufState(self.0.load(Ordering::Acquire));
            if !state.has(BM_LOCKED) {
                return state;
            }
            delay.spin();
        }
    }

    /// Acquires the header lock, returning a guard that writes the
    /// (possibly modified) state back and releases on drop.
    pub fn lock(&self) -> StateGuard<'_> {
        let mut delay = SpinDelay::new();
        loop {
            let old = self.0.fetch_or(BM_LOCKED, Ordering::Acquire);
            if old & BM_LOCKED == 0 {
                return StateGuard {
                    cell: self,
                    state: BufState(old | BM_LOCKED),
                };
            }
            while self.0.load(Ordering::Relaxed) & BM_LOCKED != 0 {
                delay.spin();
            }
        }
    }

    /// Stores a state directly. Only valid while holding the header lock
    /// or during single-threaded initialization.
    #[inline]
    pub(crate) fn store(&self, state: BufState) {
        self.0.store(state.0, Ordering::Release);
    }
}

impl Default for BufStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped header-lock acquisition.
///
/// Mutate [`StateGuard::state`] freely; the final value (minus
/// `BM_LOCKED`) is published when the guard is dropped or consumed.
#[derive(Debug)]
pub struct StateGuard<'a> {
    cell: &'a BufStateCell,
    /// The state as it will be published on release.
    pub state: BufState,
}

impl StateGuard<'_> {
    /// Releases the header lock, publishing the guard's state.
    #[inline]
    pub fn unlock(self) {
        // Drop does the store.
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.cell.store(self.state.clear(BM_LOCKED));
    }
}

/// Bounded exponential spin-then-yield backoff.
struct SpinDelay {
    spins: u32,
}

impl SpinDelay {
    const SPINS_BEFORE_YIELD: u32 = 100;

    fn new() -> Self {
        Self { spins: 0 }
    }

    #[inline]
    fn spin(&mut self) {
        if self.spins < Self::SPINS_BEFORE_YIELD {
            self.spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing_roundtrip() {
        let state = BufState(0).add_ref().add_ref().with_usage(3).set(BM_DIRTY | BM_VALID);
        assert_eq!(state.refcount(), 2);
        assert_eq!(state.usage_count(), 3);
        assert!(state.has(BM_DIRTY));
        assert!(state.has(BM_VALID));
        assert!(!state.has(BM_LOCKED));

        let state = state.sub_ref().decay_usage().clear(BM_DIRTY);
        assert_eq!(state.refcount(), 1);
        assert_eq!(state.usage_count(), 2);
        assert!(!state.has(BM_DIRTY));
    }

    #[test]
    fn test_usage_saturates() {
        let mut state = BufState(0);
        for _ in 0..10 {
            state = state.bump_usage();
        }
        assert_eq!(state.usage_count(), MAX_USAGE_COUNT);
    }

    #[test]
    fn test_refcount_does_not_leak_into_usage() {
        let state = BufState(0).with_usage(1);
        let max_ref = (1 << BUF_REFCOUNT_BITS) - 1;
        let mut s = state;
        for _ in 0..1000 {
            s = s.add_ref();
        }
        assert_eq!(s.usage_count(), 1);
        assert_eq!(s.refcount(), 1000);
        assert!(s.refcount() < max_ref);
    }

    #[test]
    fn test_lock_guard_publishes_state() {
        let cell = BufStateCell::new();
        {
            let mut guard = cell.lock();
            assert!(guard.state.has(BM_LOCKED));
            guard.state = guard.state.set(BM_VALID | BM_TAG_VALID).add_ref();
            guard.unlock();
        }
        let state = cell.load();
        assert!(!state.has(BM_LOCKED));
        assert!(state.has(BM_VALID));
        assert_eq!(state.refcount(), 1);
    }

    #[test]
    fn test_lock_mutual_exclusion() {
        use std::sync::Arc;

        let cell = Arc::new(BufStateCell::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let mut guard = cell.lock();
                    guard.state = guard.state.add_ref();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cell.load().refcount(), 4000);
    }

    #[test]
    fn test_cas_sees_concurrent_value() {
        let cell = BufStateCell::new();
        let old = cell.load();
        cell.store(BufState(0).set(BM_DIRTY));
        let err = cell.cas(old, old.add_ref()).unwrap_err();
        assert!(err.has(BM_DIRTY));
    }
}
