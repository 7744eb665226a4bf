//! Shared fixtures for the buffer pool integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use basalt_buffer::config::BufferPoolConfig;
use basalt_buffer::page;
use basalt_buffer::pool::BufferPool;
use basalt_buffer::smgr::{RelFileLocator, Relation};
use basalt_buffer::testing::{MemStorageManager, MemWal};
use basalt_common::constants::BLCKSZ;
use basalt_common::types::{DatabaseId, ForkNumber, RelationId, TablespaceId};

pub struct TestHarness {
    pub pool: Arc<BufferPool>,
    pub smgr: Arc<MemStorageManager>,
    pub wal: Arc<MemWal>,
}

pub fn harness(shared_buffers: usize) -> TestHarness {
    // A small backend limit keeps the per-backend pin budget usable with
    // test-sized pools.
    harness_with(BufferPoolConfig::new(shared_buffers).with_max_backends(4))
}

pub fn harness_with(config: BufferPoolConfig) -> TestHarness {
    let smgr = Arc::new(MemStorageManager::new());
    let wal = Arc::new(MemWal::new());
    let pool = BufferPool::new(
        config,
        Arc::clone(&smgr) as Arc<dyn basalt_buffer::smgr::StorageManager>,
        Arc::clone(&wal) as Arc<dyn basalt_buffer::wal::WalLink>,
    )
    .expect("pool creation");
    TestHarness { pool, smgr, wal }
}

pub fn locator(rel: u32) -> RelFileLocator {
    RelFileLocator::new(TablespaceId::DEFAULT, DatabaseId::new(1), RelationId::new(rel))
}

pub fn locator_in(ts: u32, rel: u32) -> RelFileLocator {
    RelFileLocator::new(TablespaceId::new(ts), DatabaseId::new(1), RelationId::new(rel))
}

pub fn rel(id: u32) -> Relation {
    Relation::permanent(locator(id))
}

/// An initialized page carrying a recognizable payload byte, with a
/// valid checksum.
pub fn formatted_page(marker: u8) -> Vec<u8> {
    let mut buf = vec![0u8; BLCKSZ];
    page::init_page(&mut buf);
    buf[page::PAGE_HEADER_SIZE] = marker;
    page::set_page_checksum(&mut buf);
    buf
}
