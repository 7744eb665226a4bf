//! Integration tests for checkpoints, the background writer, and bulk
//! drop/flush operations.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use basalt_buffer::page;
use basalt_buffer::pool::{BufferLockMode, BufferManager, ReadBufferMode};
use basalt_buffer::smgr::Relation;
use basalt_buffer::{Buffer, CheckpointFlags};
use basalt_common::types::{BlockNumber, ForkNumber, TablespaceId};

use common::{harness, locator, locator_in, rel};

fn dirty_block(
    session: &mut BufferManager,
    relation: &Relation,
    block: BlockNumber,
) -> Buffer {
    let buf = session
        .read_buffer_extended(relation, ForkNumber::Main, block, ReadBufferMode::Normal, None)
        .unwrap();
    session.lock_buffer(buf, BufferLockMode::Exclusive).unwrap();
    session
        .with_page_mut(buf, |p| {
            page::init_page(p);
            p[page::PAGE_HEADER_SIZE] = block as u8;
        })
        .unwrap();
    session.mark_dirty(buf).unwrap();
    session.unlock_release_buffer(buf).unwrap();
    buf
}

#[test]
fn checkpoint_writes_every_dirty_buffer() {
    let h = harness(32);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 8);
    let relation = rel(1);
    let mut session = h.pool.new_session();

    for block in 0..8 {
        dirty_block(&mut session, &relation, block);
    }
    assert_eq!(h.pool.stats().dirty_buffers, 8);

    let stats = session.checkpoint_buffers(CheckpointFlags::empty()).unwrap();
    assert_eq!(stats.dirty_buffers, 8);
    assert_eq!(stats.buffers_written, 8);
    assert_eq!(h.pool.stats().dirty_buffers, 0);
    assert_eq!(h.smgr.write_count(), 8);

    // Nothing dirty: the next checkpoint has no work.
    let stats = session.checkpoint_buffers(CheckpointFlags::empty()).unwrap();
    assert_eq!(stats.dirty_buffers, 0);
}

#[test]
fn checkpoint_skips_unlogged_buffers_unless_shutdown() {
    let h = harness(32);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 2);
    h.smgr.create_relation(locator(2), ForkNumber::Main, 2);
    let permanent = rel(1);
    let unlogged = Relation::unlogged(locator(2));
    let mut session = h.pool.new_session();

    dirty_block(&mut session, &permanent, 0);
    dirty_block(&mut session, &unlogged, 0);

    let stats = session.checkpoint_buffers(CheckpointFlags::empty()).unwrap();
    assert_eq!(stats.dirty_buffers, 1, "only the permanent buffer is taken");
    assert_eq!(h.pool.stats().dirty_buffers, 1, "unlogged page stays dirty");

    let stats = session
        .checkpoint_buffers(CheckpointFlags::from_bits(CheckpointFlags::IS_SHUTDOWN))
        .unwrap();
    assert_eq!(stats.dirty_buffers, 1);
    assert_eq!(h.pool.stats().dirty_buffers, 0);
}

#[test]
fn checkpoint_balances_writes_across_tablespaces() {
    let h = harness(64);
    let rel_a = Relation::permanent(locator_in(1, 10));
    let rel_b = Relation::permanent(locator_in(2, 20));
    h.smgr.create_relation(rel_a.locator, ForkNumber::Main, 12);
    h.smgr.create_relation(rel_b.locator, ForkNumber::Main, 4);
    let mut session = h.pool.new_session();

    for block in 0..12 {
        dirty_block(&mut session, &rel_a, block);
    }
    for block in 0..4 {
        dirty_block(&mut session, &rel_b, block);
    }

    let stats = session.checkpoint_buffers(CheckpointFlags::empty()).unwrap();
    assert_eq!(stats.buffers_written, 16);

    // The write sequence must interleave: tablespace B (4 pages) should
    // be visited roughly every 4 writes, not bunched at either end.
    let writes = h.smgr.write_log();
    assert_eq!(writes.len(), 16);
    let b_positions: Vec<usize> = writes
        .iter()
        .enumerate()
        .filter(|(_, (rel, _, _))| rel.tablespace == TablespaceId::new(2))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(b_positions.len(), 4);
    assert!(
        b_positions[0] <= 3,
        "first tablespace-B write too late: {b_positions:?}"
    );
    for pair in b_positions.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            (2..=6).contains(&gap),
            "tablespace-B writes bunched: {b_positions:?}"
        );
    }

    // Per-tablespace writes are block-sequential.
    let a_blocks: Vec<BlockNumber> = writes
        .iter()
        .filter(|(rel, _, _)| rel.tablespace == TablespaceId::new(1))
        .map(|(_, _, block)| *block)
        .collect();
    let mut sorted = a_blocks.clone();
    sorted.sort_unstable();
    assert_eq!(a_blocks, sorted, "writes within a tablespace are ordered");
}

#[test]
fn checkpoint_throttle_hook_sees_progress() {
    let h = harness(32);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 4);
    let relation = rel(1);
    let mut session = h.pool.new_session();
    for block in 0..4 {
        dirty_block(&mut session, &relation, block);
    }

    let calls = Arc::new(AtomicU64::new(0));
    let calls_in_hook = Arc::clone(&calls);
    h.pool.set_checkpoint_throttle(Arc::new(move |fraction| {
        assert!((0.0..=1.0).contains(&fraction));
        calls_in_hook.fetch_add(1, Ordering::Relaxed);
    }));

    session.checkpoint_buffers(CheckpointFlags::empty()).unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 4, "hook ran between writes");

    // IMMEDIATE checkpoints skip the throttle entirely.
    for block in 0..4 {
        dirty_block(&mut session, &relation, block);
    }
    calls.store(0, Ordering::Relaxed);
    session
        .checkpoint_buffers(CheckpointFlags::from_bits(CheckpointFlags::IMMEDIATE))
        .unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[test]
fn checkpoint_issues_coalesced_writebacks() {
    let h = harness(32);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 6);
    let relation = rel(1);
    let mut session = h.pool.new_session();
    for block in 0..6 {
        dirty_block(&mut session, &relation, block);
    }

    session.checkpoint_buffers(CheckpointFlags::empty()).unwrap();

    let hints = h.smgr.writeback_calls();
    assert!(!hints.is_empty(), "checkpoint schedules writeback hints");
    // Six sequential writes coalesce into one run.
    let total: usize = hints.iter().map(|(_, _, _, n)| n).sum();
    assert_eq!(total, 6);
    assert!(hints.len() <= 2, "consecutive blocks fused: {hints:?}");
}

#[test]
fn bgwriter_hibernates_on_an_idle_pool() {
    let h = harness(32);
    let mut session = h.pool.new_session();

    // With nothing allocated, each round advances the cleaning scan by
    // its minimum pace; once it has lapped the (stationary) strategy
    // point the bgwriter may sleep.
    let mut hibernate = false;
    for _ in 0..200 {
        hibernate = session.bg_buffer_sync().unwrap();
        if hibernate {
            break;
        }
    }
    assert!(hibernate, "idle pool lets the bgwriter hibernate");
    assert!(session.bgwriter_stats().rounds >= 2);
}

#[test]
fn bgwriter_disabled_by_zero_maxpages() {
    let h = common::harness_with(
        basalt_buffer::config::BufferPoolConfig::new(32)
            .with_max_backends(4)
            .with_bgwriter_lru_maxpages(0),
    );
    let mut session = h.pool.new_session();
    assert!(session.bg_buffer_sync().unwrap());
    assert_eq!(session.bgwriter_stats().rounds, 0, "disabled scan does no work");
}

#[test]
fn dropped_relation_buffers_are_discarded_not_written() {
    let h = harness(32);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 4);
    let relation = rel(1);
    let mut session = h.pool.new_session();
    for block in 0..4 {
        dirty_block(&mut session, &relation, block);
    }

    session
        .drop_relation_buffers(locator(1), &[ForkNumber::Main], &[0])
        .unwrap();
    assert_eq!(h.smgr.write_count(), 0, "dropped dirty pages are not written");
    assert_eq!(h.pool.stats().dirty_buffers, 0);

    // The blocks are gone from the cache: a read goes to disk again.
    let reads_before = h.smgr.read_count();
    let buf = session
        .read_buffer_extended(&relation, ForkNumber::Main, 0, ReadBufferMode::Normal, None)
        .unwrap();
    assert_eq!(h.smgr.read_count(), reads_before + 1);
    session.release_buffer(buf).unwrap();
}

#[test]
fn truncation_drops_only_the_tail() {
    let h = harness(32);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 6);
    let relation = rel(1);
    let mut session = h.pool.new_session();
    for block in 0..6 {
        dirty_block(&mut session, &relation, block);
    }

    // Drop blocks 3.. as a truncation would.
    session
        .drop_relation_buffers(locator(1), &[ForkNumber::Main], &[3])
        .unwrap();
    assert_eq!(h.pool.stats().dirty_buffers, 3, "head blocks stay cached");

    let reads_before = h.smgr.read_count();
    let buf = session
        .read_buffer_extended(&relation, ForkNumber::Main, 2, ReadBufferMode::Normal, None)
        .unwrap();
    assert_eq!(h.smgr.read_count(), reads_before, "head block still cached");
    session.release_buffer(buf).unwrap();
}

#[test]
fn flush_relation_buffers_writes_dirty_pages() {
    let h = harness(32);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 3);
    h.smgr.create_relation(locator(2), ForkNumber::Main, 1);
    let target = rel(1);
    let other = rel(2);
    let mut session = h.pool.new_session();
    for block in 0..3 {
        dirty_block(&mut session, &target, block);
    }
    dirty_block(&mut session, &other, 0);

    session.flush_relation_buffers(&target).unwrap();
    assert_eq!(h.smgr.write_count(), 3, "only the target relation flushed");
    assert_eq!(h.pool.stats().dirty_buffers, 1);

    // The pages remain cached and clean.
    let buf = session
        .read_buffer_extended(&target, ForkNumber::Main, 1, ReadBufferMode::Normal, None)
        .unwrap();
    assert!(!session.buffer_is_dirty(buf).unwrap());
    session.release_buffer(buf).unwrap();
}

#[test]
fn database_wide_drop_and_flush() {
    let h = harness(32);
    h.smgr.create_relation(locator(1), ForkNumber::Main, 2);
    h.smgr.create_relation(locator(2), ForkNumber::Main, 2);
    let rel_one = rel(1);
    let rel_two = rel(2);
    let mut session = h.pool.new_session();
    dirty_block(&mut session, &rel_one, 0);
    dirty_block(&mut session, &rel_two, 1);

    session
        .flush_database_buffers(rel_one.locator.database)
        .unwrap();
    assert_eq!(h.pool.stats().dirty_buffers, 0);
    assert_eq!(h.smgr.write_count(), 2);

    session
        .drop_database_buffers(rel_one.locator.database)
        .unwrap();
    let reads_before = h.smgr.read_count();
    let buf = session
        .read_buffer_extended(&rel_one, ForkNumber::Main, 0, ReadBufferMode::Normal, None)
        .unwrap();
    assert_eq!(h.smgr.read_count(), reads_before + 1, "cache was emptied by the drop");
    session.release_buffer(buf).unwrap();
}

#[test]
fn flush_relations_all_handles_long_lists() {
    let h = harness(64);
    let mut session = h.pool.new_session();
    let mut locators = Vec::new();
    for id in 1..=25u32 {
        h.smgr.create_relation(locator(id), ForkNumber::Main, 1);
        let relation = rel(id);
        dirty_block(&mut session, &relation, 0);
        locators.push(locator(id));
    }

    // 25 relations exceeds the binary-search threshold.
    session.flush_relations_all(&locators).unwrap();
    assert_eq!(h.pool.stats().dirty_buffers, 0);
    assert_eq!(h.smgr.write_count(), 25);

    session.drop_relations_all_buffers(&locators).unwrap();
    assert_eq!(h.pool.stats().pinned_buffers, 0);
}
