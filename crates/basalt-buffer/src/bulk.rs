//! Bulk invalidation and flushing of relation / database buffers.
//!
//! Dropping a relation must remove every buffer that caches one of its
//! blocks; the on-disk file is about to vanish, so dirty pages are
//! discarded without writing. Flushing writes instead of discarding.
//! Small drops use targeted mapping lookups (one per block); anything
//! larger scans the whole descriptor table, and long relation lists are
//! sorted so the scan can binary-search each tag.

use std::sync::Arc;

use basalt_common::constants::{BUF_DROP_SCAN_DIVISOR, RELS_BSEARCH_THRESHOLD};
use basalt_common::types::{BlockNumber, DatabaseId, ForkNumber};

use crate::error::BufferResult;
use crate::pool::BufferManager;
use crate::smgr::{RelFileLocator, Relation};
use crate::state::{BM_DIRTY, BM_INVALIDATE_CLEAR, BM_TAG_VALID, BM_VALID};
use crate::tag::BufferTag;

impl BufferManager {
    /// Removes every cached block of the given forks from `first_del`
    /// onward (a `first_del` of 0 drops the whole fork). Dirty pages
    /// are dropped without write; the caller guarantees the underlying
    /// file range is about to be unlinked or truncated.
    pub fn drop_relation_buffers(
        &mut self,
        rel: RelFileLocator,
        forks: &[ForkNumber],
        first_del: &[BlockNumber],
    ) -> BufferResult<()> {
        assert_eq!(forks.len(), first_del.len());
        let pool = Arc::clone(&self.pool);

        // Targeted lookups beat a full scan only when the fork sizes are
        // known and the total to invalidate is small.
        let mut total = 0usize;
        let mut sizes = Vec::with_capacity(forks.len());
        let mut all_known = true;
        for (i, &fork) in forks.iter().enumerate() {
            match pool.smgr().nblocks_cached(rel, fork) {
                Some(nblocks) => {
                    total += nblocks.saturating_sub(first_del[i]) as usize;
                    sizes.push(nblocks);
                }
                None => {
                    all_known = false;
                    break;
                }
            }
        }

        if all_known && total < pool.nbuffers() / BUF_DROP_SCAN_DIVISOR {
            for (i, &fork) in forks.iter().enumerate() {
                for block in first_del[i]..sizes[i] {
                    let tag = BufferTag::new(rel, fork, block);
                    if let Some(buf_id) = pool.mapping().lookup(&tag, tag.stable_hash()) {
                        self.invalidate_buffer(buf_id, |t| t == tag);
                    }
                }
            }
            return Ok(());
        }

        for buf_id in 0..pool.nbuffers() {
            let tag = pool.desc(buf_id).tag();
            let matches = tag.rel == rel
                && forks
                    .iter()
                    .zip(first_del)
                    .any(|(&fork, &first)| tag.fork == fork && tag.block >= first);
            if matches {
                self.invalidate_buffer(buf_id, |t| {
                    t.rel == rel
                        && forks
                            .iter()
                            .zip(first_del)
                            .any(|(&fork, &first)| t.fork == fork && t.block >= first)
                });
            }
        }
        Ok(())
    }

    /// Removes every cached block of the listed relations.
    pub fn drop_relations_all_buffers(&mut self, rels: &[RelFileLocator]) -> BufferResult<()> {
        if rels.is_empty() {
            return Ok(());
        }
        let pool = Arc::clone(&self.pool);

        // Try the targeted path: every fork size must be known and the
        // sum small.
        let mut total = 0usize;
        let mut known = true;
        'sizing: for &rel in rels {
            for fork in ForkNumber::ALL {
                if !pool.smgr().exists(rel, fork) {
                    continue;
                }
                match pool.smgr().nblocks_cached(rel, fork) {
                    Some(nblocks) => total += nblocks as usize,
                    None => {
                        known = false;
                        break 'sizing;
                    }
                }
            }
        }

        if known && total < pool.nbuffers() / BUF_DROP_SCAN_DIVISOR {
            for &rel in rels {
                for fork in ForkNumber::ALL {
                    if !pool.smgr().exists(rel, fork) {
                        continue;
                    }
                    let nblocks = pool.smgr().nblocks_cached(rel, fork).unwrap_or(0);
                    for block in 0..nblocks {
                        let tag = BufferTag::new(rel, fork, block);
                        if let Some(buf_id) = pool.mapping().lookup(&tag, tag.stable_hash()) {
                            self.invalidate_buffer(buf_id, |t| t == tag);
                        }
                    }
                }
            }
            return Ok(());
        }

        let mut sorted;
        let use_bsearch = rels.len() > RELS_BSEARCH_THRESHOLD;
        let rels: &[RelFileLocator] = if use_bsearch {
            sorted = rels.to_vec();
            sorted.sort_unstable();
            &sorted
        } else {
            rels
        };

        for buf_id in 0..pool.nbuffers() {
            let tag = pool.desc(buf_id).tag();
            let matches = if use_bsearch {
                rels.binary_search(&tag.rel).is_ok()
            } else {
                rels.contains(&tag.rel)
            };
            if matches {
                self.invalidate_buffer(buf_id, |t| rels.contains(&t.rel));
            }
        }
        Ok(())
    }

    /// Removes every cached block belonging to a database.
    pub fn drop_database_buffers(&mut self, database: DatabaseId) -> BufferResult<()> {
        let pool = Arc::clone(&self.pool);
        for buf_id in 0..pool.nbuffers() {
            if pool.desc(buf_id).tag().rel.database == database {
                self.invalidate_buffer(buf_id, |t| t.rel.database == database);
            }
        }
        Ok(())
    }

    /// Writes out every dirty cached block of one relation.
    pub fn flush_relation_buffers(&mut self, rel: &Relation) -> BufferResult<()> {
        let locator = rel.locator;
        self.flush_matching(|tag| tag.rel == locator)
    }

    /// Writes out every dirty cached block of the listed relations.
    pub fn flush_relations_all(&mut self, rels: &[RelFileLocator]) -> BufferResult<()> {
        if rels.is_empty() {
            return Ok(());
        }
        if rels.len() > RELS_BSEARCH_THRESHOLD {
            let mut sorted = rels.to_vec();
            sorted.sort_unstable();
            self.flush_matching(move |tag| sorted.binary_search(&tag.rel).is_ok())
        } else {
            let rels = rels.to_vec();
            self.flush_matching(move |tag| rels.contains(&tag.rel))
        }
    }

    /// Writes out every dirty cached block of a database.
    pub fn flush_database_buffers(&mut self, database: DatabaseId) -> BufferResult<()> {
        self.flush_matching(move |tag| tag.rel.database == database)
    }

    fn flush_matching(&mut self, matches: impl Fn(&BufferTag) -> bool) -> BufferResult<()> {
        let pool = Arc::clone(&self.pool);
        for buf_id in 0..pool.nbuffers() {
            let desc = pool.desc(buf_id);
            // Cheap unlocked pre-check before touching the header lock.
            if !matches(&desc.tag()) {
                continue;
            }
            let guard = desc.state().lock();
            if !guard.state.has(BM_VALID | BM_DIRTY) || !matches(&desc.tag()) {
                continue;
            }
            self.pin_buffer_locked(buf_id, guard);
            desc.page().lock_shared();
            let result = self.flush_buffer(buf_id);
            unsafe { desc.page().unlock_shared() };
            self.unpin_buffer(buf_id);
            result?;
        }
        self.issue_pending_writebacks();
        Ok(())
    }

    /// Invalidates one buffer if its tag still satisfies `matches`.
    ///
    /// A pinned buffer is assumed to be held by a concurrent flusher;
    /// the loop waits for its I/O and retries, as long as the tag keeps
    /// matching.
    fn invalidate_buffer(&mut self, buf_id: usize, matches: impl Fn(BufferTag) -> bool) {
        let pool = Arc::clone(&self.pool);
        let desc = pool.desc(buf_id);
        loop {
            let tag = desc.tag();
            if !matches(tag) || !tag.is_valid() {
                return;
            }
            let hash = tag.stable_hash();
            let mut partition = pool.mapping().partition_write(hash);
            let mut guard = desc.state().lock();

            // The tag may have changed between the unlocked read and the
            // locks; start over if so.
            if desc.tag() != tag || !guard.state.has(BM_TAG_VALID) {
                drop(guard);
                drop(partition);
                continue;
            }
            if guard.state.refcount() != 0 {
                drop(guard);
                drop(partition);
                desc.wait_io();
                continue;
            }

            desc.set_tag(BufferTag::INVALID);
            guard.state = guard.state.clear(BM_INVALIDATE_CLEAR).with_usage(0);
            guard.unlock();
            partition.remove(&tag);
            drop(partition);
            pool.strategy().free_buffer(buf_id);
            return;
        }
    }
}
