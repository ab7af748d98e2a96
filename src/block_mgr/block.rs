// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::BufferedBlockMgr;
use crate::io::{IoBuffer, WriteRange};
use std::sync::Arc;

pub(super) type BlockId = usize;
pub(super) type BufferId = usize;

/// Accounting partition of a block manager, returned by `register_client`
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Client(pub(super) usize);

/// Arena slot for one I/O buffer.
///
/// Blocks and buffers reference each other; both directions are indices
/// guarded by the manager lock, so either side can be repointed during
/// eviction without touching the other's memory.
pub(super) struct BufferSlot {
    pub data: Arc<IoBuffer>,

    /// Block currently associated with this buffer. A buffer on the free
    /// list may still name its previous owner so a pin of that block can
    /// reuse it without a disk read.
    pub owner: Option<BlockId>,

    /// Only max-size buffers rotate through the free list and spill
    pub is_max_size: bool,
}

/// Destination of a block's spilled data
#[derive(Clone, Debug)]
pub(super) struct WriteState {
    pub range: WriteRange,
    pub len: usize,
}

/// Arena slot for one block
pub(super) struct BlockState {
    /// Bumped whenever the slot is recycled; detects stale handles
    pub generation: u64,

    pub buffer: Option<BufferId>,
    pub write_state: Option<WriteState>,
    pub client: usize,
    pub valid_data_len: usize,
    pub num_rows: usize,
    pub is_pinned: bool,
    pub in_write: bool,
    pub is_deleted: bool,

    /// Set while the block's write is a private handover awaited by one
    /// thread inside `get_new_block`, not a pool eviction
    pub client_local: bool,
}

impl BlockState {
    pub fn new() -> Self {
        Self {
            generation: 0,
            buffer: None,
            write_state: None,
            client: 0,
            valid_data_len: 0,
            num_rows: 0,
            is_pinned: false,
            in_write: false,
            is_deleted: false,
            client_local: false,
        }
    }

    /// Resets per-use state; the slot keeps its generation, and spill
    /// range history is dropped.
    pub fn init(&mut self, client: usize) {
        self.is_pinned = false;
        self.in_write = false;
        self.is_deleted = false;
        self.client_local = false;
        self.valid_data_len = 0;
        self.num_rows = 0;
        self.write_state = None;
        self.client = client;
    }
}

/// Handle to a managed block.
///
/// The handle stays valid across spills and re-pins; it goes stale once the
/// block is deleted, after which every operation returns
/// [`crate::Error::StaleHandle`].
#[derive(Clone)]
pub struct BlockHandle {
    pub(super) mgr: Arc<BufferedBlockMgr>,
    pub(super) id: BlockId,
    pub(super) generation: u64,
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockHandle(#{} gen={})", self.id, self.generation)
    }
}

impl PartialEq for BlockHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.mgr, &other.mgr)
            && self.id == other.id
            && self.generation == other.generation
    }
}

impl Eq for BlockHandle {}

impl BlockHandle {
    /// Pins the block, reading it back from its spill range if needed.
    ///
    /// Returns `false` only for optional requests that found no slack.
    pub fn pin(&self) -> crate::Result<bool> {
        self.mgr.pin_block(self)
    }

    /// Unpins the block, making it a writeback candidate.
    pub fn unpin(&self) -> crate::Result<()> {
        self.mgr.unpin_block(self)
    }

    /// Deletes the block, releasing its buffer.
    pub fn delete(self) -> crate::Result<()> {
        self.mgr.delete_block(&self)
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.mgr
            .with_block(self, |inner, id| inner.block(id).is_pinned)
            .unwrap_or(false)
    }

    /// Returns `true` for spillable blocks of the manager's block size.
    #[must_use]
    pub fn is_max_size(&self) -> bool {
        self.mgr
            .with_block(self, |inner, id| {
                inner
                    .block(id)
                    .buffer
                    .map(|b| inner.buffer(b).is_max_size)
                    .unwrap_or(true)
            })
            .unwrap_or(false)
    }

    /// Capacity of the attached buffer.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.mgr
            .with_block(self, |inner, id| {
                inner
                    .block(id)
                    .buffer
                    .map(|b| inner.buffer(b).data.capacity())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    #[must_use]
    pub fn valid_data_len(&self) -> usize {
        self.mgr
            .with_block(self, |inner, id| inner.block(id).valid_data_len)
            .unwrap_or(0)
    }

    /// Marks `len` more bytes of the buffer as valid data, returning the
    /// offset they start at.
    pub fn allocate(&self, len: usize) -> crate::Result<usize> {
        self.mgr.with_block_mut(self, |inner, id| {
            let capacity = inner
                .block(id)
                .buffer
                .map(|b| inner.buffer(b).data.capacity())
                .unwrap_or(0);

            let state = inner.block_mut(id);

            if state.valid_data_len + len > capacity {
                return Err(crate::Error::BlockOverflow(len, 0));
            }

            let offset = state.valid_data_len;
            state.valid_data_len += len;
            Ok(offset)
        })?
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.mgr
            .with_block(self, |inner, id| inner.block(id).num_rows)
            .unwrap_or(0)
    }

    pub fn add_row(&self) {
        let _ = self.mgr.with_block_mut(self, |inner, id| {
            inner.block_mut(id).num_rows += 1;
        });
    }

    /// Returns the attached buffer.
    ///
    /// Only valid while the block is pinned; the reference must not be used
    /// after unpinning, since eviction may hand the buffer to another block.
    pub fn buffer(&self) -> crate::Result<Arc<IoBuffer>> {
        self.mgr.block_buffer(self)
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> crate::Result<()> {
        let buf = self.buffer()?;
        buf.with_data_mut(|bytes| {
            let dst = bytes
                .get_mut(offset..offset + data.len())
                .ok_or_else(|| crate::Error::BlockOverflow(data.len(), 0))?;
            dst.copy_from_slice(data);
            Ok(())
        })
    }

    /// Runs `f` over the buffer contents.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> crate::Result<R> {
        let buf = self.buffer()?;
        Ok(buf.with_data(|bytes| f(bytes)))
    }
}
