//! Integration tests for relation extension.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use basalt_buffer::error::BufferError;
use basalt_buffer::pool::ReadBufferMode;
use basalt_buffer::smgr::{RelFileLocator, SmgrResult, StorageManager};
use basalt_buffer::ExtendFlags;
use basalt_common::types::{BlockNumber, ForkNumber, MAX_BLOCK_NUMBER, P_NEW};

use common::{harness, locator, rel};

#[test]
fn extending_an_empty_relation_produces_block_zero() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 0);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let (first, buffers, extended) = session
        .extend_by(&relation, ForkNumber::Main, 1, ExtendFlags::empty(), None)
        .unwrap();
    assert_eq!(first, 0);
    assert_eq!(extended, 1);
    assert_eq!(buffers.len(), 1);
    assert_eq!(h.smgr.nblocks(locator(1), ForkNumber::Main).unwrap(), 1);
    session.release_buffer(buffers[0]).unwrap();

    // The new block is cached: a subsequent read is a hit.
    let buf = session
        .read_buffer_extended(&relation, ForkNumber::Main, 0, ReadBufferMode::Normal, None)
        .unwrap();
    assert_eq!(h.smgr.read_count(), 0, "freshly extended block reads from cache");
    assert_eq!(buffers[0], buf);
    session.release_buffer(buf).unwrap();
}

#[test]
fn extend_by_batch_returns_consecutive_pinned_blocks() {
    let h = harness(64);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 3);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let (first, buffers, extended) = session
        .extend_by(&relation, ForkNumber::Main, 4, ExtendFlags::empty(), None)
        .unwrap();
    assert_eq!(first, 3);
    assert_eq!(extended, 4);
    for (i, &buf) in buffers.iter().enumerate() {
        assert_eq!(
            session.buffer_get_block_number(buf).unwrap(),
            3 + i as BlockNumber
        );
        session.release_buffer(buf).unwrap();
    }
    assert_eq!(h.smgr.nblocks(locator(1), ForkNumber::Main).unwrap(), 7);
}

#[test]
fn lock_first_returns_the_first_buffer_locked() {
    let h = harness(64);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 0);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let (_, buffers, _) = session
        .extend_by(
            &relation,
            ForkNumber::Main,
            2,
            ExtendFlags::from_bits(ExtendFlags::LOCK_FIRST),
            None,
        )
        .unwrap();
    assert!(session.buffer_is_exclusive_locked(buffers[0]).unwrap());
    session.unlock_release_buffer(buffers[0]).unwrap();
    session.release_buffer(buffers[1]).unwrap();
}

#[test]
fn concurrent_single_block_extensions_get_distinct_blocks() {
    let h = harness(64);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 0);

    let barrier = Arc::new(Barrier::new(2));
    let mut threads = Vec::new();
    for _ in 0..2 {
        let pool = Arc::clone(&h.pool);
        let barrier = Arc::clone(&barrier);
        threads.push(thread::spawn(move || {
            let mut session = pool.new_session();
            let relation = rel(1);
            barrier.wait();
            let (first, buffers, extended) = session
                .extend_by(&relation, ForkNumber::Main, 1, ExtendFlags::empty(), None)
                .unwrap();
            assert_eq!(extended, 1);
            for buf in buffers {
                session.release_buffer(buf).unwrap();
            }
            first
        }));
    }
    let mut blocks: Vec<BlockNumber> =
        threads.into_iter().map(|t| t.join().unwrap()).collect();
    blocks.sort_unstable();

    assert_eq!(blocks, vec![0, 1], "each extender got its own block");
    assert_eq!(h.smgr.nblocks(locator(1), ForkNumber::Main).unwrap(), 2);
}

#[test]
fn racing_extension_with_lock_skip_allocates_distinct_blocks() {
    let h = harness(64);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 0);

    // One session serializes on the extension lock, the other bypasses
    // it and must be arbitrated by the mapping table alone.
    let barrier = Arc::new(Barrier::new(2));
    let mut threads = Vec::new();
    for skip_lock in [false, true] {
        let pool = Arc::clone(&h.pool);
        let barrier = Arc::clone(&barrier);
        threads.push(thread::spawn(move || {
            let mut session = pool.new_session();
            let relation = rel(1);
            let flags = if skip_lock {
                ExtendFlags::from_bits(ExtendFlags::SKIP_EXTENSION_LOCK)
            } else {
                ExtendFlags::empty()
            };
            barrier.wait();
            let (first, buffers, extended) = session
                .extend_by(&relation, ForkNumber::Main, 1, flags, None)
                .unwrap();
            assert_eq!(extended, 1);
            for buf in buffers {
                session.release_buffer(buf).unwrap();
            }
            first
        }));
    }
    let mut blocks: Vec<BlockNumber> =
        threads.into_iter().map(|t| t.join().unwrap()).collect();
    blocks.sort_unstable();

    assert_eq!(blocks, vec![0, 1], "each extender claimed its own block");
    assert_eq!(h.smgr.nblocks(locator(1), ForkNumber::Main).unwrap(), 2);
}

#[test]
fn extend_to_returns_locked_target_block() {
    let h = harness(64);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 0);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let buf = session
        .extend_to(&relation, ForkNumber::Main, 5, ExtendFlags::empty())
        .unwrap();
    assert_eq!(session.buffer_get_block_number(buf).unwrap(), 4);
    assert!(session.buffer_is_exclusive_locked(buf).unwrap());
    session
        .with_page_mut(buf, |p| assert!(p.iter().all(|&b| b == 0)))
        .unwrap();
    session.unlock_release_buffer(buf).unwrap();
    assert_eq!(h.smgr.nblocks(locator(1), ForkNumber::Main).unwrap(), 5);

    // Extending to a target the relation already covers just reads and
    // locks the target block.
    let buf = session
        .extend_to(&relation, ForkNumber::Main, 3, ExtendFlags::empty())
        .unwrap();
    assert_eq!(session.buffer_get_block_number(buf).unwrap(), 2);
    assert!(session.buffer_is_exclusive_locked(buf).unwrap());
    session.unlock_release_buffer(buf).unwrap();
    assert_eq!(h.smgr.nblocks(locator(1), ForkNumber::Main).unwrap(), 5);
}

#[test]
fn extend_upto_clamps_the_batch() {
    let h = harness(64);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 2);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let (first, buffers, extended) = session
        .extend_by(&relation, ForkNumber::Main, 8, ExtendFlags::empty(), Some(4))
        .unwrap();
    assert_eq!(first, 2);
    assert_eq!(extended, 2, "clamped to the extend_upto target");
    for buf in buffers {
        session.release_buffer(buf).unwrap();
    }
    assert_eq!(h.smgr.nblocks(locator(1), ForkNumber::Main).unwrap(), 4);
}

#[test]
fn p_new_sentinel_extends_via_the_read_path() {
    let h = harness(16);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 0);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    let buf = session
        .read_buffer_extended(&relation, ForkNumber::Main, P_NEW, ReadBufferMode::Normal, None)
        .unwrap();
    assert_eq!(session.buffer_get_block_number(buf).unwrap(), 0);
    session.release_buffer(buf).unwrap();
    assert_eq!(h.smgr.nblocks(locator(1), ForkNumber::Main).unwrap(), 1);
}

/// A storage manager that pretends the relation is already at the block
/// number limit.
struct HugeRelation(basalt_buffer::testing::MemStorageManager);

impl StorageManager for HugeRelation {
    fn exists(&self, rel: RelFileLocator, fork: ForkNumber) -> bool {
        self.0.exists(rel, fork)
    }
    fn create(&self, rel: RelFileLocator, fork: ForkNumber) -> SmgrResult<()> {
        self.0.create(rel, fork)
    }
    fn read(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        buf: &mut [u8],
    ) -> SmgrResult<()> {
        self.0.read(rel, fork, block, buf)
    }
    fn write(
        &self,
        rel: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        buf: &[u8],
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        self.0.write(rel, fork, block, buf, skip_fsync)
    }
    fn zero_extend(
        &self,
        _rel: RelFileLocator,
        _fork: ForkNumber,
        _first: BlockNumber,
        _nblocks: usize,
        _skip_fsync: bool,
    ) -> SmgrResult<()> {
        Ok(())
    }
    fn writeback(
        &self,
        _rel: RelFileLocator,
        _fork: ForkNumber,
        _first: BlockNumber,
        _nblocks: usize,
    ) -> SmgrResult<()> {
        Ok(())
    }
    fn prefetch(&self, _rel: RelFileLocator, _fork: ForkNumber, _block: BlockNumber) -> bool {
        false
    }
    fn nblocks(&self, _rel: RelFileLocator, _fork: ForkNumber) -> SmgrResult<BlockNumber> {
        Ok(MAX_BLOCK_NUMBER)
    }
    fn nblocks_cached(&self, _rel: RelFileLocator, _fork: ForkNumber) -> Option<BlockNumber> {
        Some(MAX_BLOCK_NUMBER)
    }
}

#[test]
fn extending_past_the_block_limit_fails() {
    let smgr = Arc::new(HugeRelation(basalt_buffer::testing::MemStorageManager::new()));
    let wal = Arc::new(basalt_buffer::testing::MemWal::new());
    let pool = basalt_buffer::pool::BufferPool::new(
        basalt_buffer::config::BufferPoolConfig::new(16).with_max_backends(4),
        smgr,
        wal,
    )
    .unwrap();
    let mut session = pool.new_session();
    let relation = rel(1);

    let err = session
        .extend_by(&relation, ForkNumber::Main, 2, ExtendFlags::empty(), None)
        .unwrap_err();
    assert!(matches!(err, BufferError::RelationTooLarge { .. }));
    assert_eq!(pool.stats().pinned_buffers, 0, "victims were released");
}

#[test]
fn create_fork_flag_creates_missing_fork() {
    let h = harness(16);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    assert!(!h.smgr.exists(locator(1), ForkNumber::FreeSpaceMap));
    let (first, buffers, _) = session
        .extend_by(
            &relation,
            ForkNumber::FreeSpaceMap,
            1,
            ExtendFlags::from_bits(ExtendFlags::CREATE_FORK),
            None,
        )
        .unwrap();
    assert_eq!(first, 0);
    assert!(h.smgr.exists(locator(1), ForkNumber::FreeSpaceMap));
    session.release_buffer(buffers[0]).unwrap();
}
