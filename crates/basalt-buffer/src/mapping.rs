//! Partitioned buffer mapping table.
//!
//! Maps buffer tags to descriptor indices. The table is split into
//! partitions, each guarded by its own reader/writer lock, so lookups on
//! unrelated pages never touch the same lock. A tag's partition is
//! derived from its stable hash; callers compute the hash once and pass
//! it to every operation on that tag.
//!
//! Lock protocol: lookups take the partition lock shared; insert/delete
//! (and any state transition that installs or removes a tag) take it
//! exclusive. No session ever holds two partition locks at once.

use std::collections::HashMap;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::tag::BufferTag;

pub(crate) struct BufferMapping {
    partitions: Vec<RwLock<HashMap<BufferTag, usize>>>,
    mask: u64,
}

impl BufferMapping {
    /// Creates a mapping table with `partitions` partitions (must be a
    /// power of two) sized for `nbuffers` entries total.
    pub fn new(partitions: usize, nbuffers: usize) -> Self {
        debug_assert!(partitions.is_power_of_two());
        let per_partition = (nbuffers / partitions).max(1);
        Self {
            partitions: (0..partitions)
                .map(|_| RwLock::new(HashMap::with_capacity(per_partition)))
                .collect(),
            mask: partitions as u64 - 1,
        }
    }

    #[inline]
    fn partition_index(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// Takes the tag's partition lock in share mode.
    #[inline]
    pub fn partition_read(&self, hash: u64) -> RwLockReadGuard<'_, HashMap<BufferTag, usize>> {
        self.partitions[self.partition_index(hash)].read()
    }

    /// Takes the tag's partition lock in exclusive mode.
    #[inline]
    pub fn partition_write(&self, hash: u64) -> RwLockWriteGuard<'_, HashMap<BufferTag, usize>> {
        self.partitions[self.partition_index(hash)].write()
    }

    /// Looks up a tag under a freshly taken share lock.
    pub fn lookup(&self, tag: &BufferTag, hash: u64) -> Option<usize> {
        self.partition_read(hash).get(tag).copied()
    }

    /// Number of cached tags across all partitions. Snapshot only; the
    /// answer can be stale by the time it returns.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.read().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_common::types::{DatabaseId, ForkNumber, RelationId, TablespaceId};
    use crate::smgr::RelFileLocator;

    fn tag(block: u32) -> BufferTag {
        BufferTag::new(
            RelFileLocator::new(TablespaceId::DEFAULT, DatabaseId::new(1), RelationId::new(42)),
            ForkNumber::Main,
            block,
        )
    }

    #[test]
    fn test_insert_lookup_delete() {
        let mapping = BufferMapping::new(16, 128);
        let t = tag(7);
        let h = t.stable_hash();

        assert_eq!(mapping.lookup(&t, h), None);

        mapping.partition_write(h).insert(t, 3);
        assert_eq!(mapping.lookup(&t, h), Some(3));
        assert_eq!(mapping.len(), 1);

        mapping.partition_write(h).remove(&t);
        assert_eq!(mapping.lookup(&t, h), None);
        assert_eq!(mapping.len(), 0);
    }

    #[test]
    fn test_distinct_tags_do_not_collide() {
        let mapping = BufferMapping::new(16, 128);
        for block in 0..64 {
            let t = tag(block);
            mapping.partition_write(t.stable_hash()).insert(t, block as usize);
        }
        for block in 0..64 {
            let t = tag(block);
            assert_eq!(mapping.lookup(&t, t.stable_hash()), Some(block as usize));
        }
    }

    #[test]
    fn test_concurrent_readers() {
        use std::sync::Arc;

        let mapping = Arc::new(BufferMapping::new(16, 128));
        let t = tag(1);
        let h = t.stable_hash();
        mapping.partition_write(h).insert(t, 9);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mapping = Arc::clone(&mapping);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(mapping.lookup(&t, h), Some(9));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
