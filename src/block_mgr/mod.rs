// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-query spilling memory pool.
//!
//! A [`BufferedBlockMgr`] lends fixed-size blocks to its clients under a
//! strict budget. Every client reserves a minimum number of buffers; pins
//! beyond the reservation are optional and only granted while the pool has
//! slack. When memory runs out, unpinned blocks are transparently written
//! to ephemeral spill files and their buffers recycled.

mod block;

pub use block::{BlockHandle, Client};

use block::{BlockId, BlockState, BufferId, BufferSlot, WriteState};

use crate::{
    io::{IoBuffer, IoContext, IoManager, WriteRange},
    mem::MemTracker,
    tmp::{TmpFile, TmpFileMgr},
};
use rustc_hash::FxHashMap;
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
};

/// Process-wide mapping of `query_id -> block manager`.
///
/// Concurrent creates under one query id return the same instance; the
/// manager removes its own entry on drop. The registry is an explicit
/// object owned by the process, not a global.
pub struct BlockMgrRegistry {
    map: Mutex<FxHashMap<u64, Weak<BufferedBlockMgr>>>,
    self_weak: Weak<BlockMgrRegistry>,
}

impl BlockMgrRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            map: Mutex::new(FxHashMap::default()),
            self_weak: self_weak.clone(),
        })
    }

    /// Returns the live manager for `query_id`, if any.
    #[must_use]
    pub fn get(&self, query_id: u64) -> Option<Arc<BufferedBlockMgr>> {
        self.map
            .lock()
            .expect("lock is poisoned")
            .get(&query_id)
            .and_then(Weak::upgrade)
    }

    /// Creates (or returns the existing) block manager for a query.
    ///
    /// `mem_limit <= 0` means unlimited.
    pub fn create(
        &self,
        query_id: u64,
        parent: &Arc<MemTracker>,
        mem_limit: i64,
        block_size: usize,
        io: &Arc<IoManager>,
        tmp_file_mgr: &Arc<TmpFileMgr>,
    ) -> crate::Result<Arc<BufferedBlockMgr>> {
        let mut map = self.map.lock().expect("lock is poisoned");

        if let Some(existing) = map.get(&query_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let num_devices = tmp_file_mgr.num_devices();

        let mut tmp_files = Vec::with_capacity(num_devices);
        for device_id in 0..num_devices {
            tmp_files.push(tmp_file_mgr.get_file(device_id, query_id)?);
        }

        let num_unreserved_buffers = if mem_limit > 0 {
            mem_limit / block_size as i64
        } else {
            i64::MAX
        };

        let registry = self.self_weak.clone();

        let mgr = Arc::new_cyclic(|self_weak| BufferedBlockMgr {
            max_block_size: block_size,
            block_write_threshold: num_devices,
            query_id,
            io: io.clone(),
            io_ctx: io.register_context(),
            tmp_files,
            mem_tracker: MemTracker::with_parent("block-mgr", mem_limit, parent),
            query_tracker: parent.clone(),
            registry,
            self_weak: self_weak.clone(),
            inner: Mutex::new(Inner {
                blocks: vec![],
                unused_blocks: VecDeque::new(),
                unpinned_blocks: VecDeque::new(),
                buffers: vec![],
                all_io_buffers: vec![],
                free_io_buffers: VecDeque::new(),
                clients: vec![],
                // Spread the first spill file across queries
                next_tmp_file: (query_id as usize) % num_devices,
                num_outstanding_writes: 0,
                num_unreserved_buffers,
                total_reserved_buffers: 0,
                num_unreserved_pinned_buffers: 0,
                is_cancelled: false,
                counters: Counters::default(),
            }),
            buffer_available: Condvar::new(),
            write_complete_cv: Condvar::new(),
        });

        map.insert(query_id, Arc::downgrade(&mgr));

        Ok(mgr)
    }

    fn remove_if_dead(&self, query_id: u64) {
        let mut map = self.map.lock().expect("lock is poisoned");
        if let Some(entry) = map.get(&query_id) {
            if entry.upgrade().is_none() {
                map.remove(&query_id);
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    blocks_created: u64,
    blocks_recycled: u64,
    writes_issued: u64,
    buffered_pins: u64,
    bytes_allocated: usize,
}

struct ClientState {
    num_reserved_buffers: i64,
    num_pinned_buffers: i64,
    tracker: Option<Arc<MemTracker>>,
    error: Option<String>,
}

pub(crate) struct Inner {
    blocks: Vec<BlockState>,
    unused_blocks: VecDeque<BlockId>,

    /// LIFO queue of writeback candidates
    unpinned_blocks: VecDeque<BlockId>,

    buffers: Vec<Option<BufferSlot>>,

    /// Every max-size buffer ever allocated
    all_io_buffers: Vec<BufferId>,

    /// Max-size buffers not attached to a pinned or in-write block
    free_io_buffers: VecDeque<BufferId>,

    clients: Vec<ClientState>,

    next_tmp_file: usize,
    num_outstanding_writes: usize,

    /// Buffers not covered by any client reservation (may be "infinite")
    num_unreserved_buffers: i64,
    total_reserved_buffers: i64,

    /// Pins counted against the unreserved pool
    num_unreserved_pinned_buffers: i64,

    is_cancelled: bool,
    counters: Counters,
}

impl Inner {
    pub(crate) fn block(&self, id: BlockId) -> &BlockState {
        self.blocks.get(id).expect("block id is valid")
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut BlockState {
        self.blocks.get_mut(id).expect("block id is valid")
    }

    pub(crate) fn buffer(&self, id: BufferId) -> &BufferSlot {
        self.buffers
            .get(id)
            .and_then(Option::as_ref)
            .expect("buffer id is valid")
    }

    pub(crate) fn buffer_mut(&mut self, id: BufferId) -> &mut BufferSlot {
        self.buffers
            .get_mut(id)
            .and_then(Option::as_mut)
            .expect("buffer id is valid")
    }
}

enum FindOutcome {
    /// The block is pinned; `in_mem` means its old buffer was still
    /// resident so no disk read is needed
    Pinned { in_mem: bool },

    /// Optional request, no slack; not an error
    NoBuffer,
}

/// Per-query spilling block pool
pub struct BufferedBlockMgr {
    max_block_size: usize,

    /// Writes are issued while `outstanding + free < threshold`
    /// (threshold = number of spill devices)
    block_write_threshold: usize,

    query_id: u64,

    io: Arc<IoManager>,
    io_ctx: IoContext,
    tmp_files: Vec<TmpFile>,

    /// Owner of the buffer memory; enforcement lives here
    mem_tracker: Arc<MemTracker>,

    /// Client trackers stop propagating at this ancestor
    query_tracker: Arc<MemTracker>,

    registry: Weak<BlockMgrRegistry>,

    /// Back-reference for handle construction and write callbacks
    self_weak: Weak<BufferedBlockMgr>,

    inner: Mutex<Inner>,

    /// General waiters for eviction slack
    buffer_available: Condvar,

    /// Waiters for a private write handover in `get_new_block`; woken
    /// broadly, each waiter rechecks its own block
    write_complete_cv: Condvar,
}

impl std::fmt::Debug for BufferedBlockMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("lock is poisoned");
        write!(
            f,
            "BufferedBlockMgr(query={:x}, free={}, unpinned={}, outstanding={}, \
             unreserved={}/{}, reserved={}, created={}, recycled={}, writes={}, \
             buffered_pins={}, allocated={}B)",
            self.query_id,
            inner.free_io_buffers.len(),
            inner.unpinned_blocks.len(),
            inner.num_outstanding_writes,
            inner.num_unreserved_pinned_buffers,
            inner.num_unreserved_buffers,
            inner.total_reserved_buffers,
            inner.counters.blocks_created,
            inner.counters.blocks_recycled,
            inner.counters.writes_issued,
            inner.counters.buffered_pins,
            inner.counters.bytes_allocated,
        )
    }
}

impl BufferedBlockMgr {
    #[must_use]
    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    #[must_use]
    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    #[must_use]
    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .counters
            .bytes_allocated
    }

    #[must_use]
    pub fn free_buffer_count(&self) -> usize {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .free_io_buffers
            .len()
    }

    #[must_use]
    pub fn writes_issued(&self) -> u64 {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .counters
            .writes_issued
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().expect("lock is poisoned").is_cancelled
    }

    #[must_use]
    pub fn num_pinned_buffers(&self, client: Client) -> i64 {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner
            .clients
            .get(client.0)
            .map(|c| c.num_pinned_buffers)
            .unwrap_or(0)
    }

    #[must_use]
    pub fn num_reserved_buffers_remaining(&self, client: Client) -> i64 {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner
            .clients
            .get(client.0)
            .map(|c| (c.num_reserved_buffers - c.num_pinned_buffers).max(0))
            .unwrap_or(0)
    }

    /// Error recorded against a client by a failed spill write, if any.
    #[must_use]
    pub fn client_error(&self, client: Client) -> Option<String> {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.clients.get(client.0).and_then(|c| c.error.clone())
    }

    /// Registers a client that reserves `num_reserved_buffers` max-size
    /// buffers out of the pool.
    pub fn register_client(
        &self,
        num_reserved_buffers: i64,
        tracker: Option<Arc<MemTracker>>,
    ) -> Client {
        debug_assert!(num_reserved_buffers >= 0);

        let mut inner = self.inner.lock().expect("lock is poisoned");

        inner.clients.push(ClientState {
            num_reserved_buffers,
            num_pinned_buffers: 0,
            tracker,
            error: None,
        });
        inner.num_unreserved_buffers =
            inner.num_unreserved_buffers.saturating_sub(num_reserved_buffers);
        inner.total_reserved_buffers += num_reserved_buffers;

        Client(inner.clients.len() - 1)
    }

    /// Lowers a client's reservation, returning the difference to the
    /// unreserved pool. Reservations can never be raised.
    pub fn lower_reservation(&self, client: Client, num_buffers: i64) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let state = inner.clients.get_mut(client.0).expect("client is valid");
        assert!(state.num_reserved_buffers >= num_buffers);

        let delta = state.num_reserved_buffers - num_buffers;
        state.num_reserved_buffers = num_buffers;
        inner.num_unreserved_buffers = inner.num_unreserved_buffers.saturating_add(delta);
        inner.total_reserved_buffers -= delta;
    }

    /// Optimistically checks whether `n` more optional pins could be
    /// granted to `client` right now. Used to fail a multi-block pin fast
    /// before partially pinning.
    pub fn try_acquire_tmp_reservation(&self, client: Client, n: i64) -> crate::Result<bool> {
        let inner = self.inner.lock().expect("lock is poisoned");

        if inner.is_cancelled {
            return Err(crate::Error::Cancelled);
        }

        let state = inner.clients.get(client.0).expect("client is valid");
        let reserved_slack = (state.num_reserved_buffers - state.num_pinned_buffers).max(0);
        let pool_slack = inner
            .num_unreserved_buffers
            .saturating_sub(inner.num_unreserved_pinned_buffers)
            .max(0);

        Ok(reserved_slack + pool_slack >= n)
    }

    /// Cancels the manager. Level-triggered: every waiter wakes and every
    /// subsequent operation returns [`crate::Error::Cancelled`].
    pub fn cancel(&self) {
        {
            let mut inner = self.inner.lock().expect("lock is poisoned");
            if inner.is_cancelled {
                return;
            }
            inner.is_cancelled = true;
        }

        self.io.cancel_context(&self.io_ctx);

        self.buffer_available.notify_all();
        self.write_complete_cv.notify_all();
    }

    /// Hands out a new pinned block.
    ///
    /// With `len` set, the block gets a non-spillable buffer of exactly
    /// `len` bytes (must be smaller than the max block size); a failed
    /// memory charge yields `None`, not an error, and `unpin_block` must
    /// not be given.
    ///
    /// Without `len`, a max-size buffer is found via eviction. If
    /// `unpin_block` is given and no buffer is free, the old block's
    /// contents are persisted and its buffer transferred to the new block;
    /// the call blocks until that write completes. Without `unpin_block`,
    /// an optional request that finds no slack yields `None`.
    pub fn get_new_block(
        &self,
        client: Client,
        unpin_block: Option<&BlockHandle>,
        len: Option<usize>,
    ) -> crate::Result<Option<BlockHandle>> {
        let new_id = {
            let mut inner = self.inner.lock().expect("lock is poisoned");
            if inner.is_cancelled {
                return Err(crate::Error::Cancelled);
            }
            self.get_unused_block(&mut inner, client.0)
        };

        if let Some(len) = len {
            assert!(unpin_block.is_none());
            assert!(len < self.max_block_size, "cannot request blocks this big");

            if self.mem_tracker.try_consume(len as i64) {
                let mut inner = self.inner.lock().expect("lock is poisoned");

                let buf_id = push_buffer(&mut inner, IoBuffer::alloc(len), Some(new_id), false);
                let state = inner.block_mut(new_id);
                state.buffer = Some(buf_id);
                state.is_pinned = true;
                inner.counters.bytes_allocated += len;
                self.pin_buffer_for_client(&mut inner, client.0, len);
                inner.num_unreserved_pinned_buffers += 1;

                debug_assert!(self.validate(&inner));
                return Ok(Some(self.make_handle(&inner, new_id)));
            }

            let mut inner = self.inner.lock().expect("lock is poisoned");
            inner.block_mut(new_id).is_deleted = true;
            self.return_unused_block(&mut inner, new_id);
            return Ok(None);
        }

        match self.find_buffer_for_block(new_id)? {
            FindOutcome::Pinned { in_mem } => {
                debug_assert!(!in_mem, "a new block cannot start in memory");

                if let Some(old) = unpin_block {
                    // Got a buffer without needing the transfer
                    self.unpin_block(old)?;
                }

                let inner = self.inner.lock().expect("lock is poisoned");
                Ok(Some(self.make_handle(&inner, new_id)))
            }

            FindOutcome::NoBuffer => {
                let Some(old) = unpin_block else {
                    let mut inner = self.inner.lock().expect("lock is poisoned");
                    inner.block_mut(new_id).is_deleted = true;
                    self.return_unused_block(&mut inner, new_id);
                    return Ok(None);
                };

                // Transfer the old block's buffer: persist it first, then
                // hand its buffer to the new block
                let mut inner = self.inner.lock().expect("lock is poisoned");
                self.check_handle(&inner, old)?;

                {
                    let old_state = inner.block_mut(old.id);
                    debug_assert!(old_state.is_pinned);
                    old_state.is_pinned = false;
                    old_state.client_local = true;
                }
                self.write_unpinned_block(&mut inner, old.id)?;

                while inner.block(old.id).in_write && !inner.is_cancelled {
                    inner = self
                        .write_complete_cv
                        .wait(inner)
                        .expect("lock is poisoned");
                }
                if inner.is_cancelled {
                    return Err(crate::Error::Cancelled);
                }

                let buf_id = inner
                    .block(old.id)
                    .buffer
                    .expect("handed-over block retains its buffer");
                inner.block_mut(old.id).buffer = None;
                inner.buffer_mut(buf_id).owner = Some(new_id);

                let new_state = inner.block_mut(new_id);
                new_state.buffer = Some(buf_id);
                new_state.is_pinned = true;

                debug_assert!(self.validate(&inner));
                Ok(Some(self.make_handle(&inner, new_id)))
            }
        }
    }

    /// See [`BlockHandle::pin`].
    pub(crate) fn pin_block(&self, handle: &BlockHandle) -> crate::Result<bool> {
        {
            let inner = self.inner.lock().expect("lock is poisoned");
            if inner.is_cancelled {
                return Err(crate::Error::Cancelled);
            }
            self.check_handle(&inner, handle)?;

            if inner.block(handle.id).is_pinned {
                return Ok(true);
            }
        }

        let in_mem = match self.find_buffer_for_block(handle.id)? {
            FindOutcome::NoBuffer => return Ok(false),
            FindOutcome::Pinned { in_mem } => in_mem,
        };

        // Read the block back from its spill range unless the buffer never
        // left memory or the block holds no data
        let read_plan = {
            let inner = self.inner.lock().expect("lock is poisoned");
            let state = inner.block(handle.id);

            if in_mem || state.valid_data_len == 0 {
                None
            } else {
                let write_state = state
                    .write_state
                    .clone()
                    .expect("evicted block has a spill range");
                let buf_id = state.buffer.expect("pinned block has a buffer");
                Some((write_state, inner.buffer(buf_id).data.clone()))
            }
        };

        if let Some((write_state, buf)) = read_plan {
            buf.with_data_mut(|data| {
                let dst = data
                    .get_mut(..write_state.len)
                    .expect("spill range fits the buffer");
                self.io
                    .read_into(&self.io_ctx, &write_state.range.file, write_state.range.offset, dst)
            })?;

            log::trace!(
                "read back block #{} ({}B) from {:?}",
                handle.id,
                write_state.len,
                write_state.range.file,
            );
        }

        Ok(true)
    }

    /// Pins `handle` while releasing `release`: the released block is
    /// unpinned (or deleted) first so its buffer can serve the pin.
    pub fn pin_block_with_release(
        &self,
        handle: &BlockHandle,
        release: &BlockHandle,
        unpin_old: bool,
    ) -> crate::Result<bool> {
        if unpin_old {
            self.unpin_block(release)?;
        } else {
            self.delete_block(release)?;
        }
        self.pin_block(handle)
    }

    /// See [`BlockHandle::unpin`].
    pub(crate) fn unpin_block(&self, handle: &BlockHandle) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if inner.is_cancelled {
            return Err(crate::Error::Cancelled);
        }
        self.check_handle(&inner, handle)?;

        if !inner.block(handle.id).is_pinned {
            return Ok(());
        }

        let buf_id = inner.block(handle.id).buffer.expect("pinned block has a buffer");
        let buf_len = inner.buffer(buf_id).data.capacity();
        assert!(
            inner.buffer(buf_id).is_max_size,
            "can only unpin max-size blocks",
        );

        inner.block_mut(handle.id).is_pinned = false;

        debug_assert!(!inner.unpinned_blocks.contains(&handle.id));
        if !inner.block(handle.id).in_write {
            inner.unpinned_blocks.push_back(handle.id);
        }

        let client = inner.block(handle.id).client;
        {
            let state = inner.clients.get(client).expect("client is valid");
            if state.num_pinned_buffers > state.num_reserved_buffers {
                inner.num_unreserved_pinned_buffers -= 1;
            }
        }
        self.unpin_buffer_for_client(&mut inner, client, buf_len);

        self.write_unpinned_blocks(&mut inner)?;

        debug_assert!(self.validate(&inner));
        Ok(())
    }

    /// See [`BlockHandle::delete`].
    pub(crate) fn delete_block(&self, handle: &BlockHandle) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if inner.is_cancelled {
            return Err(crate::Error::Cancelled);
        }
        self.check_handle(&inner, handle)?;

        let id = handle.id;
        inner.block_mut(id).is_deleted = true;

        if inner.block(id).is_pinned {
            inner.block_mut(id).is_pinned = false;

            let client = inner.block(id).client;
            {
                let state = inner.clients.get(client).expect("client is valid");
                if state.num_pinned_buffers > state.num_reserved_buffers {
                    inner.num_unreserved_pinned_buffers -= 1;
                }
            }

            let buf_len = inner
                .block(id)
                .buffer
                .map(|b| inner.buffer(b).data.capacity())
                .expect("pinned block has a buffer");
            self.unpin_buffer_for_client(&mut inner, client, buf_len);
        } else if let Some(pos) = inner.unpinned_blocks.iter().position(|&b| b == id) {
            inner.unpinned_blocks.remove(pos);
        }

        if inner.block(id).in_write {
            // Write completion reclaims the buffer and the shell
            return Ok(());
        }

        if let Some(buf_id) = inner.block(id).buffer {
            if !inner.buffer(buf_id).is_max_size {
                let len = inner.buffer(buf_id).data.capacity();
                *inner.buffers.get_mut(buf_id).expect("buffer id is valid") = None;
                inner.counters.bytes_allocated -= len;
                self.mem_tracker.release(len as i64);
            } else {
                if !inner.free_io_buffers.contains(&buf_id) {
                    inner.free_io_buffers.push_back(buf_id);
                    self.buffer_available.notify_one();
                }
                inner.buffer_mut(buf_id).owner = None;
            }
            inner.block_mut(id).buffer = None;
        }

        self.return_unused_block(&mut inner, id);

        debug_assert!(self.validate(&inner));
        Ok(())
    }

    // ---- internals ------------------------------------------------------

    fn make_handle(&self, inner: &Inner, id: BlockId) -> BlockHandle {
        BlockHandle {
            mgr: self.self_weak.upgrade().expect("self is alive"),
            id,
            generation: inner.block(id).generation,
        }
    }

    fn check_handle(&self, inner: &Inner, handle: &BlockHandle) -> crate::Result<()> {
        let state = inner.block(handle.id);
        if state.generation != handle.generation || state.is_deleted {
            return Err(crate::Error::StaleHandle);
        }
        Ok(())
    }

    pub(crate) fn with_block<R>(
        &self,
        handle: &BlockHandle,
        f: impl FnOnce(&Inner, BlockId) -> R,
    ) -> crate::Result<R> {
        let inner = self.inner.lock().expect("lock is poisoned");
        self.check_handle(&inner, handle)?;
        Ok(f(&inner, handle.id))
    }

    pub(crate) fn with_block_mut<R>(
        &self,
        handle: &BlockHandle,
        f: impl FnOnce(&mut Inner, BlockId) -> R,
    ) -> crate::Result<R> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        self.check_handle(&inner, handle)?;
        Ok(f(&mut inner, handle.id))
    }

    pub(crate) fn block_buffer(&self, handle: &BlockHandle) -> crate::Result<Arc<IoBuffer>> {
        let inner = self.inner.lock().expect("lock is poisoned");
        self.check_handle(&inner, handle)?;

        let state = inner.block(handle.id);
        assert!(state.is_pinned, "block data is only accessible while pinned");

        let buf_id = state.buffer.expect("pinned block has a buffer");
        Ok(inner.buffer(buf_id).data.clone())
    }

    fn get_unused_block(&self, inner: &mut Inner, client: usize) -> BlockId {
        if let Some(id) = inner.unused_blocks.pop_front() {
            inner.block_mut(id).init(client);
            inner.counters.blocks_recycled += 1;
            id
        } else {
            let id = inner.blocks.len();
            let mut state = BlockState::new();
            state.client = client;
            inner.blocks.push(state);
            inner.counters.blocks_created += 1;
            id
        }
    }

    fn return_unused_block(&self, inner: &mut Inner, id: BlockId) {
        let state = inner.block_mut(id);
        debug_assert!(state.is_deleted);
        debug_assert!(!state.is_pinned);
        debug_assert!(state.buffer.is_none());

        // Recycling invalidates every outstanding handle
        state.generation += 1;

        inner.unused_blocks.push_back(id);
    }

    fn pin_buffer_for_client(&self, inner: &mut Inner, client: usize, len: usize) {
        let state = inner.clients.get_mut(client).expect("client is valid");
        state.num_pinned_buffers += 1;
        if let Some(tracker) = &state.tracker {
            tracker.consume_local(len as i64, &self.query_tracker);
        }
    }

    fn unpin_buffer_for_client(&self, inner: &mut Inner, client: usize, len: usize) {
        let state = inner.clients.get_mut(client).expect("client is valid");
        debug_assert!(state.num_pinned_buffers > 0);
        state.num_pinned_buffers -= 1;
        if let Some(tracker) = &state.tracker {
            tracker.release_local(len as i64, &self.query_tracker);
        }
    }

    /// Finds and pins a buffer for `block`.
    ///
    /// Preference order for fresh buffers: grow the pool while the free
    /// list is below the write threshold, then take from the free list,
    /// then issue writes and wait for an eviction.
    fn find_buffer_for_block(&self, block_id: BlockId) -> crate::Result<FindOutcome> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let client = inner.block(block_id).client;
        debug_assert!(!inner.block(block_id).is_pinned);
        debug_assert!(!inner.block(block_id).is_deleted);
        debug_assert!(self.validate(&inner));

        let is_optional_request = {
            let state = inner.clients.get(client).expect("client is valid");
            state.num_pinned_buffers >= state.num_reserved_buffers
        };

        if is_optional_request
            && inner.num_unreserved_pinned_buffers >= inner.num_unreserved_buffers
        {
            // The client has its quota and the shared pool is exhausted
            return Ok(FindOutcome::NoBuffer);
        }

        let mut in_mem = false;

        if let Some(buf_id) = inner.block(block_id).buffer {
            // Still resident: it is either queued for writeback, mid-write,
            // or sitting in the free list awaiting reassignment
            if let Some(pos) = inner.unpinned_blocks.iter().position(|&b| b == block_id) {
                inner.unpinned_blocks.remove(pos);
                debug_assert!(!inner.free_io_buffers.contains(&buf_id));
            } else if inner.block(block_id).in_write {
                debug_assert!(!inner.free_io_buffers.contains(&buf_id));
            } else if let Some(pos) = inner.free_io_buffers.iter().position(|&b| b == buf_id) {
                inner.free_io_buffers.remove(pos);
            }

            inner.counters.buffered_pins += 1;
            in_mem = true;
        } else {
            let mut buffer_id: Option<BufferId> = None;

            if inner.free_io_buffers.len() < self.block_write_threshold
                && self.mem_tracker.try_consume(self.max_block_size as i64)
            {
                let id = push_buffer(
                    &mut inner,
                    IoBuffer::alloc(self.max_block_size),
                    None,
                    true,
                );
                inner.all_io_buffers.push(id);
                inner.counters.bytes_allocated += self.max_block_size;
                buffer_id = Some(id);
            }

            if buffer_id.is_none() {
                if inner.free_io_buffers.is_empty()
                    && inner.unpinned_blocks.is_empty()
                    && inner.num_outstanding_writes == 0
                {
                    // Nothing to evict: fail required requests, let
                    // optional ones degrade gracefully
                    if is_optional_request {
                        return Ok(FindOutcome::NoBuffer);
                    }
                    return Err(crate::Error::MemLimitExceeded(
                        "query did not have enough memory to get the minimum required buffers"
                            .into(),
                    ));
                }

                while inner.free_io_buffers.is_empty() {
                    self.write_unpinned_blocks(&mut inner)?;
                    inner = self.buffer_available.wait(inner).expect("lock is poisoned");
                    if inner.is_cancelled {
                        return Err(crate::Error::Cancelled);
                    }
                }
                buffer_id = inner.free_io_buffers.pop_front();
            }

            let buf_id = buffer_id.expect("a buffer was found above");

            if let Some(prev_owner) = inner.buffer(buf_id).owner {
                if prev_owner != block_id {
                    // Evict: break the previous block's link before reuse
                    inner.block_mut(prev_owner).buffer = None;
                }
            }
            inner.buffer_mut(buf_id).owner = Some(block_id);
            inner.block_mut(block_id).buffer = Some(buf_id);
        }

        let buf_len = inner
            .block(block_id)
            .buffer
            .map(|b| inner.buffer(b).data.capacity())
            .expect("buffer was just attached");

        self.pin_buffer_for_client(&mut inner, client, buf_len);
        if is_optional_request {
            inner.num_unreserved_pinned_buffers += 1;
        }
        inner.block_mut(block_id).is_pinned = true;

        // The free pool shrank; top up writeback
        self.write_unpinned_blocks(&mut inner)?;

        debug_assert!(self.validate(&inner));
        Ok(FindOutcome::Pinned { in_mem })
    }

    /// Issues writes LIFO from the unpinned queue while below the
    /// writeback threshold. Caller holds the lock.
    fn write_unpinned_blocks(&self, inner: &mut MutexGuard<'_, Inner>) -> crate::Result<()> {
        while inner.num_outstanding_writes + inner.free_io_buffers.len()
            < self.block_write_threshold
        {
            let Some(id) = inner.unpinned_blocks.pop_back() else {
                break;
            };
            inner.block_mut(id).client_local = false;
            self.write_unpinned_block(inner, id)?;
            inner.num_outstanding_writes += 1;
        }
        debug_assert!(self.validate(inner));
        Ok(())
    }

    /// Issues the spill write for one block. Caller holds the lock.
    fn write_unpinned_block(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        id: BlockId,
    ) -> crate::Result<()> {
        debug_assert!(!inner.block(id).is_pinned);
        debug_assert!(!inner.block(id).in_write);

        if inner.block(id).write_state.is_none() {
            // First spill of this block: pick the next file round-robin
            let file_idx = inner.next_tmp_file;
            inner.next_tmp_file = (inner.next_tmp_file + 1) % self.tmp_files.len();

            let tmp_file = self.tmp_files.get(file_idx).expect("file index is valid");
            let offset = tmp_file.allocate_space(self.max_block_size as u64);
            let disk_id = tmp_file.device_id() % self.io.num_disks();

            inner.block_mut(id).write_state = Some(WriteState {
                range: WriteRange {
                    file: tmp_file.path().into(),
                    offset,
                    disk_id,
                },
                len: 0,
            });
        }

        let valid_len = inner.block(id).valid_data_len;
        let buf_id = inner.block(id).buffer.expect("unpinned block retains its buffer");
        let buf = inner.buffer(buf_id).data.clone();

        let range = {
            let write_state = inner
                .block_mut(id)
                .write_state
                .as_mut()
                .expect("write state was just set");
            write_state.len = valid_len;
            write_state.range.clone()
        };

        let mgr = self.self_weak.upgrade().expect("self is alive");
        self.io.add_write_range(
            &self.io_ctx,
            range,
            buf,
            valid_len,
            Box::new(move |status| mgr.write_complete(id, status)),
        )?;

        inner.block_mut(id).in_write = true;
        inner.counters.writes_issued += 1;
        if inner.counters.writes_issued == 1 {
            log::debug!("query {:x} started spilling", self.query_id);
        }

        Ok(())
    }

    /// Invoked by the I/O manager when a spill write finishes.
    ///
    /// Must not panic: it runs on an I/O worker while holding the manager
    /// lock, and every exit path leaves the counters consistent.
    fn write_complete(&self, id: BlockId, status: crate::Result<()>) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        debug_assert!(inner.block(id).in_write, "completion for block not in write");

        if !inner.block(id).client_local {
            debug_assert!(inner.num_outstanding_writes > 0);
            inner.num_outstanding_writes -= 1;
        }
        inner.block_mut(id).in_write = false;

        if inner.is_cancelled {
            // Short-circuit resource return; waiters were already woken by
            // cancel(), but wake again in case one raced in
            self.write_complete_cv.notify_all();
            self.buffer_available.notify_all();
            return;
        }

        if let Err(e) = status {
            log::error!("spill write for block #{id} failed: {e}");

            let client = inner.block(id).client;
            if let Some(state) = inner.clients.get_mut(client) {
                state.error = Some(e.to_string());
            }
            inner.is_cancelled = true;

            if inner.block(id).client_local {
                self.write_complete_cv.notify_all();
            } else {
                self.buffer_available.notify_all();
            }
            return;
        }

        if inner.block(id).is_pinned {
            // Re-pinned while queued; the buffer stays attached
            debug_assert!(!inner.block(id).client_local);
            if let Err(e) = self.write_unpinned_blocks(&mut inner) {
                log::warn!("writeback after re-pin failed: {e}");
            }
            debug_assert!(self.validate(&inner));
            return;
        }

        if inner.block(id).client_local {
            debug_assert!(!inner.block(id).is_deleted, "client should be waiting");
            self.write_complete_cv.notify_all();
            return;
        }

        let buf_id = inner.block(id).buffer.expect("spilled block retains its buffer");
        debug_assert!(inner.buffer(buf_id).is_max_size, "only max-size buffers spill");

        inner.free_io_buffers.push_back(buf_id);

        if inner.block(id).is_deleted {
            inner.buffer_mut(buf_id).owner = None;
            inner.block_mut(id).buffer = None;
            self.return_unused_block(&mut inner, id);
        }

        debug_assert!(self.validate(&inner));
        self.buffer_available.notify_one();
    }

    /// Cross-checks the free list, the unpinned queue and the buffer/block
    /// links. Debug builds only; any violation is fatal.
    #[allow(clippy::cognitive_complexity)]
    fn validate(&self, inner: &Inner) -> bool {
        if inner.num_unreserved_pinned_buffers < 0 {
            log::error!("negative unreserved pinned count");
            return false;
        }

        let mut num_free = 0;

        for &buf_id in &inner.all_io_buffers {
            let Some(slot) = inner.buffers.get(buf_id).and_then(Option::as_ref) else {
                log::error!("max-size buffer slot was freed");
                return false;
            };

            let is_free = inner.free_io_buffers.contains(&buf_id);
            num_free += usize::from(is_free);

            if slot.owner.is_none() && !is_free {
                log::error!("buffer with no block not in free list");
                return false;
            }

            if let Some(owner) = slot.owner {
                let block = inner.block(owner);
                if is_free
                    && (block.is_pinned
                        || block.in_write
                        || inner.unpinned_blocks.contains(&owner))
                {
                    log::error!("free buffer attached to an active block");
                    return false;
                }
            }
        }

        if num_free != inner.free_io_buffers.len() {
            log::error!("free list inconsistency");
            return false;
        }

        for &block_id in &inner.unpinned_blocks {
            let block = inner.block(block_id);

            if block.is_pinned || block.is_deleted || block.in_write {
                log::error!("unpinned list holds an active block");
                return false;
            }

            match block.buffer {
                None => {
                    log::error!("unpersisted block without buffer");
                    return false;
                }
                Some(buf_id) => {
                    if inner.free_io_buffers.contains(&buf_id) {
                        log::error!("unpinned block's buffer is in the free list");
                        return false;
                    }
                }
            }
        }

        // Writes must keep up while below the threshold
        if !inner.is_cancelled
            && !inner.unpinned_blocks.is_empty()
            && inner.free_io_buffers.len() + inner.num_outstanding_writes
                < self.block_write_threshold
        {
            log::error!("missed writing unpinned blocks");
            return false;
        }

        true
    }
}

fn push_buffer(
    inner: &mut Inner,
    data: Arc<IoBuffer>,
    owner: Option<BlockId>,
    is_max_size: bool,
) -> BufferId {
    let id = inner.buffers.len();
    inner.buffers.push(Some(BufferSlot {
        data,
        owner,
        is_max_size,
    }));
    id
}

impl Drop for BufferedBlockMgr {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_dead(self.query_id);
        }

        self.io.cancel_context(&self.io_ctx);

        for file in &self.tmp_files {
            if let Err(e) = file.remove() {
                log::warn!("failed to remove spill file {:?}: {e}", file.path());
            }
        }

        let inner = self.inner.get_mut().expect("lock is poisoned");
        self.mem_tracker.release(inner.counters.bytes_allocated as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn make_env(num_devices: usize) -> (Arc<IoManager>, Arc<TmpFileMgr>, Arc<MemTracker>) {
        let io = IoManager::new(num_devices);
        let tmp = Arc::new(TmpFileMgr::new(num_devices).expect("tmp dir is writable"));
        let tracker = MemTracker::root("query", -1);
        (io, tmp, tracker)
    }

    #[test]
    fn block_mgr_registry_dedupes_by_query() -> crate::Result<()> {
        let (io, tmp, tracker) = make_env(1);
        let registry = BlockMgrRegistry::new();

        let a = registry.create(1, &tracker, -1, 1024, &io, &tmp)?;
        let b = registry.create(1, &tracker, -1, 1024, &io, &tmp)?;
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.create(2, &tracker, -1, 1024, &io, &tmp)?;
        assert!(!Arc::ptr_eq(&a, &c));

        drop(a);
        drop(b);
        assert!(registry.get(1).is_none());
        assert!(registry.get(2).is_some());

        Ok(())
    }

    #[test]
    fn block_mgr_small_block_charge_failure_returns_none() -> crate::Result<()> {
        let (io, tmp, tracker) = make_env(1);
        let registry = BlockMgrRegistry::new();

        let mgr = registry.create(3, &tracker, 4096, 4096, &io, &tmp)?;
        let client = mgr.register_client(0, None);

        // Fits the limit
        let small = mgr
            .get_new_block(client, None, Some(1024))?
            .expect("charge fits");
        assert!(small.is_pinned());
        assert!(!small.is_max_size());
        assert_eq!(1024, small.buffer_len());

        // Exceeds what is left
        assert!(mgr.get_new_block(client, None, Some(3584))?.is_none());

        small.delete()?;
        Ok(())
    }

    #[test]
    fn block_mgr_stale_handle_detected() -> crate::Result<()> {
        let (io, tmp, tracker) = make_env(1);
        let registry = BlockMgrRegistry::new();

        let mgr = registry.create(4, &tracker, -1, 1024, &io, &tmp)?;
        let client = mgr.register_client(1, None);

        let block = mgr
            .get_new_block(client, None, None)?
            .expect("required block");
        let stale = block.clone();
        block.delete()?;

        assert!(matches!(stale.pin(), Err(crate::Error::StaleHandle)));
        assert!(matches!(stale.unpin(), Err(crate::Error::StaleHandle)));

        Ok(())
    }

    #[test]
    fn block_mgr_lower_reservation_returns_capacity() -> crate::Result<()> {
        let (io, tmp, tracker) = make_env(1);
        let registry = BlockMgrRegistry::new();

        // Two buffers total, both reserved
        let mgr = registry.create(5, &tracker, 2 * 4096, 4096, &io, &tmp)?;
        let greedy = mgr.register_client(2, None);
        let other = mgr.register_client(0, None);

        // No slack for optional requests
        assert!(!mgr.try_acquire_tmp_reservation(other, 1)?);

        mgr.lower_reservation(greedy, 1);
        assert!(mgr.try_acquire_tmp_reservation(other, 1)?);

        Ok(())
    }

    #[test]
    fn block_mgr_write_and_read_block_data() -> crate::Result<()> {
        let (io, tmp, tracker) = make_env(1);
        let registry = BlockMgrRegistry::new();

        let mgr = registry.create(6, &tracker, -1, 4096, &io, &tmp)?;
        let client = mgr.register_client(1, None);

        let block = mgr.get_new_block(client, None, None)?.expect("required");
        assert_eq!(0, block.allocate(4096)?);
        block.write_at(16, b"hello")?;

        let read = block.with_data(|data| data.get(16..21).map(<[u8]>::to_vec))?;
        assert_eq!(Some(b"hello".to_vec()), read);

        block.delete()?;
        Ok(())
    }
}
