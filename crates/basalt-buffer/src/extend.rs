//! Relation extension.
//!
//! Growing a relation is not a read: the new blocks exist only once the
//! storage manager has zero-extended the file, and every session racing
//! on the same relation must agree on which block numbers it got. The
//! expensive part, acquiring and cleaning victim buffers, happens
//! *before* the per-relation extension lock is taken, so the lock covers
//! only the size check, the mapping inserts, and one `zero_extend` call.
//!
//! A caller may skip the extension lock when it can guarantee
//! exclusivity by other means, so the mapping table doubles as the
//! block-number arbiter: an extension buffer is installed with its input
//! I/O already claimed, making the tag insert the atomic "this block is
//! mine" step. A collision therefore means one of two things, and the
//! current file size tells them apart: a buffer for a block the file
//! already covers belongs to a concurrent extension (re-read the size
//! and restart from the new end), while a buffer for a block past the
//! end is debris from a failed earlier extension (wait out any I/O and
//! adopt it).

use std::collections::hash_map::Entry;
use std::sync::Arc;

use basalt_common::types::{BlockNumber, ForkNumber, MAX_BLOCK_NUMBER};
use tracing::debug;

use crate::descriptor::BufferDesc;
use crate::error::{BufferError, BufferResult};
use crate::page;
use crate::pool::{BufferLockMode, BufferManager};
use crate::smgr::Relation;
use crate::state::{BM_IO_ERROR, BM_IO_IN_PROGRESS, BM_PERMANENT, BM_TAG_VALID, BM_VALID};
use crate::tag::BufferTag;
use crate::Buffer;

/// Behavior flags for relation extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendFlags(u16);

impl ExtendFlags {
    /// The caller already holds the relation's extension lock (or knows
    /// no other session can extend concurrently).
    pub const SKIP_EXTENSION_LOCK: u16 = 1 << 0;
    /// Return with the first new buffer content-locked exclusively.
    pub const LOCK_FIRST: u16 = 1 << 1;
    /// Return with the `extend_upto` target buffer content-locked
    /// exclusively.
    pub const LOCK_TARGET: u16 = 1 << 2;
    /// Create the fork if it does not exist yet.
    pub const CREATE_FORK: u16 = 1 << 3;

    /// Creates empty flags.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Returns the flags with `bits` added.
    #[inline]
    #[must_use]
    pub const fn with(self, bits: u16) -> Self {
        Self(self.0 | bits)
    }

    /// Returns true if every bit in `bits` is set.
    #[inline]
    #[must_use]
    pub const fn has(self, bits: u16) -> bool {
        self.0 & bits == bits
    }
}

/// One block of an extension attempt.
#[derive(Debug, Clone, Copy)]
struct ExtendEntry {
    buf_id: usize,
    /// Whether we hold the buffer's input-I/O claim (false only for an
    /// adopted already-valid zero page).
    claimed: bool,
}

/// Outcome of claiming one block number.
enum BlockClaim {
    Entry(ExtendEntry),
    /// A concurrent extension owns this block; re-read the size and
    /// start the attempt over.
    Restart,
}

impl BufferManager {
    /// Extends a relation fork by up to `extend_by` blocks.
    ///
    /// Returns the first new block number, a pinned handle per new
    /// block, and how many blocks were actually added (the request is
    /// capped by the per-backend pin budget and by `extend_upto`).
    pub fn extend_by(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        extend_by: usize,
        flags: ExtendFlags,
        extend_upto: Option<BlockNumber>,
    ) -> BufferResult<(BlockNumber, Vec<Buffer>, usize)> {
        assert!(extend_by > 0, "extension of zero blocks");
        self.check_relation_access(rel)?;
        let pool = Arc::clone(&self.pool);

        if flags.has(ExtendFlags::CREATE_FORK) && !pool.smgr().exists(rel.locator, fork) {
            pool.smgr().create(rel.locator, fork)?;
        }

        // Cap the batch at a fair share of the pool so one extender
        // cannot pin everything.
        let budget = (pool.nbuffers() / pool.config().max_backends).max(1);
        let count = extend_by.min(budget.saturating_sub(self.pins.held_buffers()).max(1));

        // Collect clean victims while no lock is held; any dirty-page
        // flushing happens here, outside the extension lock.
        let mut victims: Vec<usize> = Vec::with_capacity(count);
        for _ in 0..count {
            match self.get_victim_buffer(None) {
                Ok(buf_id) => {
                    self.zero_victim(buf_id);
                    victims.push(buf_id);
                }
                Err(e) => {
                    self.release_victims(&victims);
                    return Err(e);
                }
            }
        }

        let result = self.extend_shared(rel, fork, count, flags, extend_upto, &mut victims);

        // Whatever is left on the victim stack goes back to the pool,
        // on success and failure alike.
        let leftovers = std::mem::take(&mut victims);
        self.release_victims(&leftovers);
        result
    }

    /// The locked portion of an extension: size query, block claiming,
    /// and the file grow. Victims are popped from (and, on restarts,
    /// recycled back onto) the caller's stack.
    fn extend_shared(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        count: usize,
        flags: ExtendFlags,
        extend_upto: Option<BlockNumber>,
        victims: &mut Vec<usize>,
    ) -> BufferResult<(BlockNumber, Vec<Buffer>, usize)> {
        let pool = Arc::clone(&self.pool);
        let extension_lock =
            (!flags.has(ExtendFlags::SKIP_EXTENSION_LOCK)).then(|| pool.extension_lock(rel.locator));
        let extension_guard = extension_lock.as_ref().map(|lock| lock.lock());

        let mut entries: Vec<ExtendEntry> = Vec::new();
        let (first_block, attempt_count) = 'attempt: loop {
            let first_block = pool.smgr().nblocks(rel.locator, fork)?;

            let mut attempt_count = count;
            if let Some(upto) = extend_upto {
                attempt_count = attempt_count.min(upto.saturating_sub(first_block) as usize);
                if attempt_count == 0 {
                    return Ok((first_block, Vec::new(), 0));
                }
            }
            if first_block as u64 + attempt_count as u64 > MAX_BLOCK_NUMBER as u64 + 1 {
                return Err(BufferError::RelationTooLarge {
                    rel: rel.locator,
                    max: MAX_BLOCK_NUMBER,
                });
            }

            for i in 0..attempt_count {
                let block = first_block + i as BlockNumber;
                match self.claim_extension_block(rel, fork, block, victims) {
                    Ok(BlockClaim::Entry(entry)) => entries.push(entry),
                    Ok(BlockClaim::Restart) => {
                        self.abandon_attempt(&mut entries, victims);
                        continue 'attempt;
                    }
                    Err(e) => {
                        self.abandon_attempt(&mut entries, victims);
                        return Err(e);
                    }
                }
            }
            break (first_block, attempt_count);
        };

        // Grow the file. Adopted debris can sit past the current end,
        // so only the missing tail is extended.
        let extend_result = match pool.smgr().nblocks(rel.locator, fork) {
            Ok(current) => {
                let target = first_block + attempt_count as BlockNumber;
                if current < target {
                    pool.smgr().zero_extend(
                        rel.locator,
                        fork,
                        current,
                        (target - current) as usize,
                        false,
                    )
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };
        drop(extension_guard);

        if let Err(e) = extend_result {
            self.abandon_attempt(&mut entries, victims);
            return Err(BufferError::WriteError {
                rel: rel.locator,
                block: first_block,
                source: e,
            });
        }

        // Publish the blocks, locking the requested one first.
        let mut handles = Vec::with_capacity(attempt_count);
        for (i, entry) in entries.iter().enumerate() {
            let block = first_block + i as BlockNumber;
            let desc = pool.desc(entry.buf_id);
            let lock_this = (flags.has(ExtendFlags::LOCK_FIRST) && i == 0)
                || (flags.has(ExtendFlags::LOCK_TARGET)
                    && extend_upto.is_some_and(|upto| block == upto - 1));
            if lock_this {
                desc.page().lock_exclusive();
            }
            if entry.claimed {
                let mut guard = desc.state().lock();
                guard.state = guard
                    .state
                    .clear(BM_IO_IN_PROGRESS | BM_IO_ERROR)
                    .set(BM_VALID);
                guard.unlock();
                desc.broadcast_io();
            }
            handles.push(Buffer::from_buf_id(entry.buf_id));
        }

        self.usage.shared_blks_written += attempt_count as u64;
        Ok((first_block, handles, attempt_count))
    }

    /// Claims one block number for this extension attempt: installs a
    /// victim with its I/O pre-claimed, or resolves a mapping collision.
    fn claim_extension_block(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        block: BlockNumber,
        victims: &mut Vec<usize>,
    ) -> BufferResult<BlockClaim> {
        let pool = Arc::clone(&self.pool);
        let tag = BufferTag::new(rel.locator, fork, block);
        let hash = tag.stable_hash();

        // A fresh install needs a victim in hand before the partition
        // lock is taken. Restart recycling can leave the stack short.
        if victims.is_empty() {
            let buf_id = self.get_victim_buffer(None)?;
            self.zero_victim(buf_id);
            victims.push(buf_id);
        }

        let mut installed: Option<usize> = None;
        let preexisting = {
            let mut partition = pool.mapping().partition_write(hash);
            match partition.entry(tag) {
                Entry::Vacant(entry) => {
                    let victim = victims.pop().expect("victim reserved above");
                    entry.insert(victim);
                    let desc = pool.desc(victim);
                    let mut guard = desc.state().lock();
                    desc.set_tag(tag);
                    // Claiming the input I/O together with the tag makes
                    // the insert the atomic block allocation: any racer
                    // waits on the claim instead of adopting the block.
                    guard.state = guard
                        .state
                        .set(BM_TAG_VALID | BM_IO_IN_PROGRESS)
                        .with_usage(1);
                    if rel.fork_is_permanent(fork) {
                        guard.state = guard.state.set(BM_PERMANENT);
                    }
                    guard.unlock();
                    installed = Some(victim);
                    None
                }
                Entry::Occupied(entry) => {
                    let buf_id = *entry.get();
                    let valid = self.pin_buffer(buf_id, None);
                    Some((buf_id, valid))
                }
            }
        };

        let Some((buf_id, valid)) = preexisting else {
            let buf_id = installed.expect("fresh install recorded");
            return Ok(BlockClaim::Entry(ExtendEntry {
                buf_id,
                claimed: true,
            }));
        };

        debug!(tag = %tag, "found pre-existing buffer while extending");
        if valid {
            if !self.page_is_new(pool.desc(buf_id)) {
                self.unpin_buffer(buf_id);
                return Err(BufferError::UnexpectedDataBeyondEof {
                    rel: rel.locator,
                    block,
                });
            }
            // A valid zero page inside the file was created by a
            // concurrent extension; one past the end is dead debris.
            let current = match pool.smgr().nblocks(rel.locator, fork) {
                Ok(n) => n,
                Err(e) => {
                    self.unpin_buffer(buf_id);
                    return Err(e.into());
                }
            };
            if block < current {
                self.unpin_buffer(buf_id);
                return Ok(BlockClaim::Restart);
            }
            return Ok(BlockClaim::Entry(ExtendEntry {
                buf_id,
                claimed: false,
            }));
        }

        if Self::claim_extend_io(pool.desc(buf_id)) {
            // Ours now; make sure it is still the buffer we probed and
            // hand the caller a zeroed page.
            if pool.desc(buf_id).tag() != tag {
                self.release_claim(buf_id);
                self.unpin_buffer(buf_id);
                return Ok(BlockClaim::Restart);
            }
            self.zero_victim(buf_id);
            return Ok(BlockClaim::Entry(ExtendEntry {
                buf_id,
                claimed: true,
            }));
        }

        // The claim wait ended with the buffer valid: a concurrent
        // extension finished this block while we watched.
        self.unpin_buffer(buf_id);
        Ok(BlockClaim::Restart)
    }

    /// Unwinds a half-built attempt: claims are released and the
    /// buffers recycled as victims where possible.
    fn abandon_attempt(&mut self, entries: &mut Vec<ExtendEntry>, victims: &mut Vec<usize>) {
        for entry in entries.drain(..) {
            if entry.claimed {
                self.release_claim(entry.buf_id);
            }
            if self.invalidate_victim(entry.buf_id) {
                self.zero_victim(entry.buf_id);
                victims.push(entry.buf_id);
            } else {
                // Someone (a racer waiting on our claim) pinned it; the
                // tag stays and they adopt the buffer.
                self.unpin_buffer(entry.buf_id);
            }
        }
    }

    /// Gives up an input-I/O claim taken during an extension attempt.
    fn release_claim(&mut self, buf_id: usize) {
        let desc = self.pool.desc(buf_id);
        {
            let mut guard = desc.state().lock();
            debug_assert!(guard.state.has(BM_IO_IN_PROGRESS));
            guard.state = guard.state.clear(BM_IO_IN_PROGRESS).set(BM_IO_ERROR);
        }
        desc.broadcast_io();
    }

    /// Extends the relation until it is at least `target` blocks long
    /// and returns an exclusively locked, pinned handle to block
    /// `target − 1`.
    pub fn extend_to(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        target: BlockNumber,
        flags: ExtendFlags,
    ) -> BufferResult<Buffer> {
        assert!(target > 0, "extension target of zero blocks");
        let pool = Arc::clone(&self.pool);

        let mut locked_target: Option<Buffer> = None;
        while pool.smgr().nblocks(rel.locator, fork)? < target {
            let want = (target - pool.smgr().nblocks(rel.locator, fork)?) as usize;
            let (first, handles, extended) = self.extend_by(
                rel,
                fork,
                want,
                flags.with(ExtendFlags::LOCK_TARGET),
                Some(target),
            )?;
            for (i, handle) in handles.into_iter().enumerate() {
                if first + i as BlockNumber == target - 1 {
                    locked_target = Some(handle);
                } else {
                    self.release_buffer(handle)?;
                }
            }
            if extended == 0 {
                // Someone else extended past the target concurrently.
                break;
            }
        }

        match locked_target {
            Some(handle) => Ok(handle),
            None => {
                // The relation already covered the target; read the
                // block the ordinary way and lock it.
                let handle = self.read_buffer_extended(
                    rel,
                    fork,
                    target - 1,
                    crate::pool::ReadBufferMode::Normal,
                    None,
                )?;
                self.lock_buffer(handle, BufferLockMode::Exclusive)?;
                Ok(handle)
            }
        }
    }

    /// Single-block convenience wrapper: extends the fork by one block
    /// and returns its pinned (optionally locked) handle.
    pub fn extend_buffered_rel(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        flags: ExtendFlags,
    ) -> BufferResult<Buffer> {
        let (_, mut handles, extended) = self.extend_by(rel, fork, 1, flags, None)?;
        debug_assert_eq!(extended, 1);
        Ok(handles.pop().unwrap_or(Buffer::INVALID))
    }

    fn release_victims(&mut self, victims: &[usize]) {
        for &buf_id in victims {
            self.release_victim(buf_id);
        }
    }

    /// Zero-fills a buffer this session has pinned.
    fn zero_victim(&self, buf_id: usize) {
        let desc = self.pool.desc(buf_id);
        desc.page().lock_exclusive();
        unsafe { desc.page().bytes_mut().fill(0) };
        unsafe { desc.page().unlock_exclusive() };
    }

    fn page_is_new(&self, desc: &BufferDesc) -> bool {
        desc.page().lock_shared();
        let is_new = unsafe { page::page_is_new(desc.page().bytes()) };
        unsafe { desc.page().unlock_shared() };
        is_new
    }

    /// Claims input I/O on a tagged extension buffer, waiting out any
    /// I/O already in flight. Returns false if the buffer became valid
    /// instead (a concurrent session finished it).
    fn claim_extend_io(desc: &BufferDesc) -> bool {
        loop {
            {
                let mut guard = desc.state().lock();
                if !guard.state.has(BM_IO_IN_PROGRESS) {
                    if guard.state.has(BM_VALID) {
                        return false;
                    }
                    guard.state = guard.state.set(BM_IO_IN_PROGRESS);
                    return true;
                }
            }
            desc.wait_io();
        }
    }
}
