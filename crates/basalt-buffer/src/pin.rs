//! Per-session pin accounting.
//!
//! Each session tracks how many times it has pinned each buffer so the
//! shared refcount is touched once per buffer, not once per pin. The
//! tracker is a small fixed array (fast path, no allocation) backed by an
//! overflow map. One array slot is pre-reserved before the shared pin
//! protocol runs so no allocation ever happens while a header lock is
//! held.

use std::collections::HashMap;

use basalt_common::constants::PRIVATE_REFCOUNT_ARRAY_SIZE;

use crate::Buffer;

#[derive(Debug, Clone, Copy)]
struct RefCountEntry {
    buffer: Buffer,
    refcount: u32,
}

impl RefCountEntry {
    const EMPTY: Self = Self {
        buffer: Buffer::INVALID,
        refcount: 0,
    };

    #[inline]
    fn is_empty(&self) -> bool {
        self.buffer == Buffer::INVALID
    }
}

/// Session-local (buffer, refcount) table.
pub(crate) struct PrivateRefCount {
    array: [RefCountEntry; PRIVATE_REFCOUNT_ARRAY_SIZE],
    overflow: HashMap<Buffer, u32>,
    /// Round-robin displacement pointer.
    clock: usize,
    /// Index of an array slot guaranteed free for the next new entry.
    reserved: Option<usize>,
}

impl PrivateRefCount {
    pub fn new() -> Self {
        Self {
            array: [RefCountEntry::EMPTY; PRIVATE_REFCOUNT_ARRAY_SIZE],
            overflow: HashMap::new(),
            clock: 0,
            reserved: None,
        }
    }

    /// Makes sure a free array slot exists, displacing one entry into
    /// the overflow map if necessary. Called before any operation that
    /// may create a new entry.
    pub fn reserve(&mut self) {
        if self.reserved.is_some() {
            return;
        }
        if let Some(free) = self.array.iter().position(RefCountEntry::is_empty) {
            self.reserved = Some(free);
            return;
        }
        // All slots occupied: displace the one under the clock pointer.
        let victim = self.clock;
        self.clock = (self.clock + 1) % PRIVATE_REFCOUNT_ARRAY_SIZE;
        let entry = self.array[victim];
        self.overflow.insert(entry.buffer, entry.refcount);
        self.array[victim] = RefCountEntry::EMPTY;
        self.reserved = Some(victim);
    }

    /// Returns this session's refcount for `buffer` (0 if untracked).
    pub fn get(&self, buffer: Buffer) -> u32 {
        for entry in &self.array {
            if entry.buffer == buffer {
                return entry.refcount;
            }
        }
        self.overflow.get(&buffer).copied().unwrap_or(0)
    }

    /// Increments the local refcount if the buffer is already tracked,
    /// promoting an overflow entry back into the array when a slot is
    /// free. Returns false if the buffer is untracked.
    pub fn inc_existing(&mut self, buffer: Buffer) -> bool {
        for entry in self.array.iter_mut() {
            if entry.buffer == buffer {
                entry.refcount += 1;
                return true;
            }
        }
        let Some(count) = self.overflow.remove(&buffer) else {
            return false;
        };
        // Prefer moving it back into the array; the reserved slot is
        // not consumed for promotions.
        let slot = self
            .array
            .iter()
            .enumerate()
            .position(|(i, e)| e.is_empty() && Some(i) != self.reserved);
        match slot {
            Some(i) => {
                self.array[i] = RefCountEntry {
                    buffer,
                    refcount: count + 1,
                };
            }
            None => {
                self.overflow.insert(buffer, count + 1);
            }
        }
        true
    }

    /// Records the first local pin of `buffer` using the reserved slot.
    pub fn insert_new(&mut self, buffer: Buffer) {
        debug_assert_eq!(self.get(buffer), 0);
        let slot = self
            .reserved
            .take()
            .expect("no reserved refcount entry before new pin");
        debug_assert!(self.array[slot].is_empty());
        self.array[slot] = RefCountEntry {
            buffer,
            refcount: 1,
        };
    }

    /// Decrements the local refcount. Returns the remaining local count;
    /// at zero the entry is removed and the caller must drop its share
    /// of the shared refcount.
    pub fn dec(&mut self, buffer: Buffer) -> u32 {
        for entry in self.array.iter_mut() {
            if entry.buffer == buffer {
                entry.refcount -= 1;
                if entry.refcount == 0 {
                    *entry = RefCountEntry::EMPTY;
                    return 0;
                }
                return entry.refcount;
            }
        }
        let count = self
            .overflow
            .get_mut(&buffer)
            .expect("unpin of buffer this session does not hold");
        *count -= 1;
        if *count == 0 {
            self.overflow.remove(&buffer);
            return 0;
        }
        *count
    }

    /// Number of distinct buffers this session holds pins on.
    pub fn held_buffers(&self) -> usize {
        self.array.iter().filter(|e| !e.is_empty()).count() + self.overflow.len()
    }

    /// Snapshot of every held (buffer, refcount) pair.
    pub fn entries(&self) -> Vec<(Buffer, u32)> {
        let mut out: Vec<(Buffer, u32)> = self
            .array
            .iter()
            .filter(|e| !e.is_empty())
            .map(|e| (e.buffer, e.refcount))
            .collect();
        out.extend(self.overflow.iter().map(|(&b, &c)| (b, c)));
        out
    }
}

/// Per-session registry of pins, released in bulk at transaction end or
/// on unwind.
///
/// Every successful pin is remembered here; explicit releases forget the
/// corresponding record. Whatever remains at release time is a leak (or
/// an abort) and is force-unpinned by the owner's teardown.
pub(crate) struct ResourceOwner {
    pins: Vec<Buffer>,
}

impl ResourceOwner {
    pub fn new() -> Self {
        Self { pins: Vec::new() }
    }

    pub fn remember_buffer(&mut self, buffer: Buffer) {
        self.pins.push(buffer);
    }

    pub fn forget_buffer(&mut self, buffer: Buffer) {
        if let Some(pos) = self.pins.iter().rposition(|&b| b == buffer) {
            self.pins.swap_remove(pos);
        }
    }

    /// Drains every remembered pin for bulk release.
    pub fn take_all(&mut self) -> Vec<Buffer> {
        std::mem::take(&mut self.pins)
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: usize) -> Buffer {
        Buffer::from_buf_id(id)
    }

    #[test]
    fn test_pin_unpin_fast_path() {
        let mut pins = PrivateRefCount::new();
        pins.reserve();
        pins.insert_new(buffer(1));
        assert_eq!(pins.get(buffer(1)), 1);

        assert!(pins.inc_existing(buffer(1)));
        assert_eq!(pins.get(buffer(1)), 2);

        assert_eq!(pins.dec(buffer(1)), 1);
        assert_eq!(pins.dec(buffer(1)), 0);
        assert_eq!(pins.get(buffer(1)), 0);
        assert_eq!(pins.held_buffers(), 0);
    }

    #[test]
    fn test_overflow_displacement() {
        let mut pins = PrivateRefCount::new();
        // Fill every array slot and one more.
        for i in 0..PRIVATE_REFCOUNT_ARRAY_SIZE + 1 {
            pins.reserve();
            pins.insert_new(buffer(i));
        }
        assert_eq!(pins.held_buffers(), PRIVATE_REFCOUNT_ARRAY_SIZE + 1);
        // Every buffer is still tracked, wherever it lives.
        for i in 0..PRIVATE_REFCOUNT_ARRAY_SIZE + 1 {
            assert_eq!(pins.get(buffer(i)), 1, "buffer {i}");
        }
    }

    #[test]
    fn test_promotion_back_to_array() {
        let mut pins = PrivateRefCount::new();
        for i in 0..PRIVATE_REFCOUNT_ARRAY_SIZE + 1 {
            pins.reserve();
            pins.insert_new(buffer(i));
        }
        // Drop enough array entries to open slots.
        let displaced: Vec<(Buffer, u32)> = pins
            .entries()
            .into_iter()
            .filter(|&(b, _)| pins.overflow.contains_key(&b))
            .collect();
        assert_eq!(displaced.len(), 1);
        let (spilled, _) = displaced[0];

        for i in 0..PRIVATE_REFCOUNT_ARRAY_SIZE + 1 {
            let b = buffer(i);
            if b != spilled && pins.get(b) > 0 {
                pins.dec(b);
            }
        }
        // Touching the spilled entry promotes it into the now-empty array.
        assert!(pins.inc_existing(spilled));
        assert!(pins.overflow.is_empty());
        assert_eq!(pins.get(spilled), 2);
    }

    #[test]
    fn test_reserved_slot_survives_reserve_calls() {
        let mut pins = PrivateRefCount::new();
        pins.reserve();
        pins.reserve();
        pins.insert_new(buffer(9));
        assert_eq!(pins.get(buffer(9)), 1);
    }

    #[test]
    fn test_resource_owner_forget_and_drain() {
        let mut owner = ResourceOwner::new();
        owner.remember_buffer(buffer(1));
        owner.remember_buffer(buffer(2));
        owner.remember_buffer(buffer(1));

        owner.forget_buffer(buffer(1));
        let mut rest = owner.take_all();
        rest.sort_by_key(|b| b.raw());
        assert_eq!(rest, vec![buffer(1), buffer(2)]);
        assert!(owner.is_empty());
    }
}
