// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Append-only, read-once (or pin-and-rescan) stream of rows over managed
//! blocks.
//!
//! Rows are serialized into blocks with a compact in-block encoding: an
//! optional null-indicator prefix (one bit per tuple per row), then densely
//! packed rows. Each row is its tuples' fixed bodies in descriptor order,
//! followed by the inlined string payloads per tuple, followed by the
//! inlined collection payloads per tuple. Var-len parts record only their
//! length in the fixed body; payload offsets are implicit, which lets the
//! read path reconstruct everything in a single left-to-right sweep.

mod serde;

use crate::{
    block_mgr::{BlockHandle, BufferedBlockMgr, Client},
    io::IoBuffer,
    row::{Row, RowBatch, RowDescriptor},
    util,
};
use std::{collections::VecDeque, sync::Arc};

/// The first blocks of a stream use these sizes and never spill, so tiny
/// streams do not each hog a max-size buffer.
const INITIAL_BLOCK_SIZES: [usize; 2] = [64 * 1024, 512 * 1024];
const NUM_SMALL_BLOCKS: usize = INITIAL_BLOCK_SIZES.len();

/// Stable position of a row within a stream, captured at append time.
///
/// Only usable while the stream is pinned and not in delete-on-read mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RowIdx {
    /// Ordinal of the block within the stream
    pub block_idx: usize,

    /// Byte offset of the row's fixed data within the block
    pub offset: usize,

    /// Ordinal of the row within its block
    pub row_ord: usize,
}

/// Read cursor state for the active block
struct ReadCursor {
    /// Index into `blocks`
    block: usize,

    /// Ordinal of the block in the whole stream (differs from `block`
    /// once delete-on-read starts popping)
    block_ord: usize,

    buf: Arc<IoBuffer>,
    ptr: usize,
    end: usize,

    /// Running tuple count used to address null-indicator bits
    tuple_idx: usize,
}

/// Buffered, spillable row stream over a block manager client
pub struct BufferedTupleStream {
    desc: RowDescriptor,
    mgr: Arc<BufferedBlockMgr>,
    client: Client,

    use_small_buffers: bool,
    delete_on_read: bool,
    read_write: bool,
    pinned: bool,
    closed: bool,

    has_nullable_tuple: bool,
    fixed_tuple_row_size: usize,
    fixed_tuple_sizes: Vec<usize>,

    /// `(tuple_idx, string slot indices)` for tuples with inlined strings
    inlined_string_slots: Vec<(usize, Vec<usize>)>,

    /// `(tuple_idx, collection slot indices)`
    inlined_coll_slots: Vec<(usize, Vec<usize>)>,

    /// Worst-case null-indicator prefix for a max-size block
    max_null_indicators_size: usize,

    blocks: VecDeque<BlockHandle>,

    write_block: Option<BlockHandle>,
    write_buf: Option<Arc<IoBuffer>>,
    write_ptr: usize,
    write_end: usize,
    write_tuple_idx: usize,
    write_null_indicator_bytes: usize,

    read: Option<ReadCursor>,

    num_pinned: usize,
    num_small_blocks: usize,
    num_rows: u64,
    rows_returned: u64,
    total_byte_size: u64,

    row_scratch: Vec<u8>,
}

impl std::fmt::Debug for BufferedTupleStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BufferedTupleStream(rows={}, returned={}, blocks={}, pinned={}, delete_on_read={})",
            self.num_rows,
            self.rows_returned,
            self.blocks.len(),
            self.pinned,
            self.delete_on_read,
        )
    }
}

impl BufferedTupleStream {
    /// Creates a stream for rows shaped like `desc`.
    ///
    /// With `use_initial_small_buffers`, the first blocks are small
    /// non-spillable bootstrap buffers. `read_write` allows reading while
    /// still appending.
    #[must_use]
    pub fn new(
        desc: RowDescriptor,
        mgr: Arc<BufferedBlockMgr>,
        client: Client,
        use_initial_small_buffers: bool,
        read_write: bool,
    ) -> Self {
        let has_nullable_tuple = desc.is_any_tuple_nullable();
        let fixed_tuple_sizes: Vec<usize> =
            desc.tuples.iter().map(|t| t.byte_size()).collect();
        let fixed_tuple_row_size = fixed_tuple_sizes.iter().sum();

        let mut inlined_string_slots = vec![];
        let mut inlined_coll_slots = vec![];
        for (tuple_idx, tuple_desc) in desc.tuples.iter().enumerate() {
            let strings = tuple_desc.string_slots();
            if !strings.is_empty() {
                inlined_string_slots.push((tuple_idx, strings));
            }
            let colls = tuple_desc.collection_slots();
            if !colls.is_empty() {
                inlined_coll_slots.push((tuple_idx, colls));
            }
        }

        Self {
            desc,
            mgr,
            client,
            use_small_buffers: use_initial_small_buffers,
            delete_on_read: false,
            read_write,
            pinned: true,
            closed: false,
            has_nullable_tuple,
            fixed_tuple_row_size,
            fixed_tuple_sizes,
            inlined_string_slots,
            inlined_coll_slots,
            max_null_indicators_size: 0,
            blocks: VecDeque::new(),
            write_block: None,
            write_buf: None,
            write_ptr: 0,
            write_end: 0,
            write_tuple_idx: 0,
            write_null_indicator_bytes: 0,
            read: None,
            num_pinned: 0,
            num_small_blocks: 0,
            num_rows: 0,
            rows_returned: 0,
            total_byte_size: 0,
            row_scratch: vec![],
        }
    }

    /// Allocates the first write block. Must be called before appending.
    ///
    /// With `pinned = false` the stream starts unpinned and its sealed
    /// blocks become eviction candidates immediately.
    pub fn init(&mut self, pinned: bool) -> crate::Result<()> {
        match self.compute_null_indicator_bytes(self.mgr.max_block_size()) {
            Some(size) => self.max_null_indicators_size = size,
            None => {
                // Not even one row fits a max-size block
                let one_row_bits = self.desc.tuples_per_row();
                return Err(crate::Error::BlockOverflow(
                    self.fixed_tuple_row_size,
                    util::round_up_to_8(util::bytes_for_bits(one_row_bits)),
                ));
            }
        }

        if self.mgr.max_block_size() < INITIAL_BLOCK_SIZES[0] {
            self.use_small_buffers = false;
        }

        if !self.new_write_block_for_row(self.fixed_tuple_row_size)? {
            return Err(crate::Error::MemLimitExceeded(
                "could not allocate the initial stream buffer within the reservation".into(),
            ));
        }

        if !pinned {
            self.unpin_stream(false)?;
        }

        Ok(())
    }

    #[must_use]
    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    #[must_use]
    pub fn rows_returned(&self) -> u64 {
        self.rows_returned
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.total_byte_size
    }

    #[must_use]
    pub fn using_small_buffers(&self) -> bool {
        self.use_small_buffers
    }

    /// Number of blocks currently owned by the stream (delete-on-read
    /// shrinks this as blocks are consumed).
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn blocks_unpinned(&self) -> usize {
        self.blocks.len() - self.num_pinned - self.num_small_blocks
    }

    /// Bytes of pinned max-size buffers held by this stream.
    #[must_use]
    pub fn bytes_in_mem(&self, ignore_current: bool) -> u64 {
        let mut result = 0;
        for block in &self.blocks {
            if !block.is_pinned() || !block.is_max_size() {
                continue;
            }
            if ignore_current && Some(block) == self.write_block.as_ref() {
                continue;
            }
            result += block.buffer_len() as u64;
        }
        result
    }

    /// Appends a row, transparently starting a new write block when the
    /// current one is full.
    ///
    /// Returns `false` if no new block could be obtained (the caller may
    /// unpin, spill more, or fail with its own error).
    pub fn add_row(&mut self, row: &Row) -> crate::Result<bool> {
        if self.deep_copy(row)? {
            return Ok(true);
        }

        let row_size = self.compute_row_size(row);
        if !self.new_write_block_for_row(row_size)? {
            return Ok(false);
        }

        self.deep_copy(row)
    }

    /// Switches from small bootstrap buffers to max-size blocks.
    ///
    /// Returns whether a write buffer is available afterwards.
    pub fn switch_to_io_buffers(&mut self) -> crate::Result<bool> {
        if !self.use_small_buffers {
            return Ok(self.write_block.is_some());
        }

        self.use_small_buffers = false;

        let got_block = self.new_write_block(
            self.mgr.max_block_size(),
            self.max_null_indicators_size,
        )?;

        // Keep using small buffers if the upgrade failed, so a later retry
        // takes this path again
        self.use_small_buffers = !got_block;
        Ok(got_block)
    }

    /// Deletes all blocks. The stream must not be used afterwards.
    pub fn close(&mut self) {
        for block in std::mem::take(&mut self.blocks) {
            if let Err(e) = block.delete() {
                log::debug!("dropping stream block during close failed: {e}");
            }
        }
        self.write_block = None;
        self.write_buf = None;
        self.read = None;
        self.num_pinned = 0;
        self.closed = true;
    }

    /// Worst-case null-indicator prefix size for a block of `block_size`,
    /// or `None` if not even one row would fit.
    fn compute_null_indicator_bytes(&self, block_size: usize) -> Option<usize> {
        if !self.has_nullable_tuple {
            return Some(0);
        }

        let tuples_per_row = self.desc.tuples_per_row();
        let min_row_size_bits = 8 * self.fixed_tuple_row_size + tuples_per_row;
        let block_size_bits = 8 * block_size;
        let max_num_rows = block_size_bits / min_row_size_bits;

        if max_num_rows == 0 {
            return None;
        }

        Some(util::round_up_to_8(util::bytes_for_bits(
            max_num_rows * tuples_per_row,
        )))
    }

    fn new_write_block_for_row(&mut self, row_size: usize) -> crate::Result<bool> {
        if self.use_small_buffers {
            if self.blocks.len() >= NUM_SMALL_BLOCKS {
                // Out of bootstrap sizes; the caller decides whether to
                // switch to max-size buffers
                return Ok(false);
            }

            let block_len = INITIAL_BLOCK_SIZES
                .get(self.blocks.len())
                .copied()
                .expect("len was checked");
            let Some(null_indicators) = self.compute_null_indicator_bytes(block_len) else {
                return Ok(false);
            };

            // A small buffer is only worth it if it is smaller than the
            // configured block size and a full row fits
            if block_len >= self.mgr.max_block_size()
                || row_size + null_indicators > block_len
            {
                return Ok(false);
            }

            return self.new_write_block(block_len, null_indicators);
        }

        let block_len = self.mgr.max_block_size();
        if row_size + self.max_null_indicators_size > block_len {
            return Err(crate::Error::BlockOverflow(
                row_size,
                self.max_null_indicators_size,
            ));
        }

        self.new_write_block(block_len, self.max_null_indicators_size)
    }

    fn new_write_block(
        &mut self,
        block_len: usize,
        null_indicator_bytes: usize,
    ) -> crate::Result<bool> {
        debug_assert!(!self.closed);

        // Unpin the current write block in tandem, unless it must stay
        // resident (pinned stream, shared with the read cursor, or small)
        let mut unpin_block = self.write_block.clone();
        if let Some(write_block) = &self.write_block {
            debug_assert!(write_block.is_pinned());
            let read_is_here = self
                .read
                .as_ref()
                .and_then(|r| self.blocks.get(r.block))
                .is_some_and(|b| b == write_block);
            if self.pinned || read_is_here || !write_block.is_max_size() {
                unpin_block = None;
            }
        }

        let len_request = (block_len < self.mgr.max_block_size()).then_some(block_len);
        let new_block = self
            .mgr
            .get_new_block(self.client, unpin_block.as_ref(), len_request)?;

        let Some(new_block) = new_block else {
            debug_assert!(unpin_block.is_none());
            return Ok(false);
        };

        if unpin_block.is_some() {
            self.num_pinned -= 1;
        }

        // Mark the whole block as valid data up front so spills cover it
        new_block.allocate(block_len)?;

        self.write_null_indicator_bytes = null_indicator_bytes;
        self.write_tuple_idx = 0;
        self.write_ptr = null_indicator_bytes;
        self.write_end = block_len;

        self.write_buf = Some(new_block.buffer()?);
        self.blocks.push_back(new_block.clone());

        if new_block.is_max_size() {
            self.num_pinned += 1;
        } else {
            self.num_small_blocks += 1;
        }

        self.write_block = Some(new_block);
        self.total_byte_size += block_len as u64;

        Ok(true)
    }

    /// Serialized size of `row` in this stream's encoding.
    #[must_use]
    pub fn compute_row_size(&self, row: &Row) -> usize {
        serde::row_serialized_size(&self.desc, row)
    }

    /// Copies `row` into the current write block.
    ///
    /// All-or-nothing: returns `false` without side effects when the row
    /// does not fit, in which case the caller requests a new block.
    pub fn deep_copy(&mut self, row: &Row) -> crate::Result<bool> {
        let Some(write_block) = self.write_block.clone() else {
            return Ok(false);
        };
        debug_assert!(write_block.is_pinned());
        debug_assert_eq!(self.desc.tuples_per_row(), row.tuples.len());

        let tuples_per_row = self.desc.tuples_per_row();

        if self.has_nullable_tuple
            && self.write_tuple_idx + tuples_per_row > self.write_null_indicator_bytes * 8
        {
            return Ok(false);
        }

        self.row_scratch.clear();
        serde::serialize_row(
            &self.desc,
            row,
            self.has_nullable_tuple,
            &self.inlined_string_slots,
            &self.inlined_coll_slots,
            &mut self.row_scratch,
        )?;

        if self.row_scratch.len() > self.write_end - self.write_ptr {
            return Ok(false);
        }

        let buf = self.write_buf.as_ref().expect("write block is pinned");
        let write_ptr = self.write_ptr;
        let write_tuple_idx = self.write_tuple_idx;
        let scratch = &self.row_scratch;
        let has_nullable = self.has_nullable_tuple;

        buf.with_data_mut(|data| {
            if has_nullable {
                for (j, tuple) in row.tuples.iter().enumerate() {
                    let bit = write_tuple_idx + j;
                    let word = data
                        .get_mut(bit >> 3)
                        .expect("null indicator prefix is in bounds");
                    let mask = 1u8 << (7 - (bit & 7));
                    if tuple.is_some() {
                        *word &= !mask;
                    } else {
                        *word |= mask;
                    }
                }
            }

            let dst = data
                .get_mut(write_ptr..write_ptr + scratch.len())
                .expect("row fits the remaining block space");
            dst.copy_from_slice(scratch);
        });

        self.write_ptr += self.row_scratch.len();
        if self.has_nullable_tuple {
            self.write_tuple_idx += tuples_per_row;
        }

        write_block.add_row();
        self.num_rows += 1;
        Ok(true)
    }

    /// Materializes the read cursor at the start of the stream.
    ///
    /// Returns `false` if a block needed for reading could not be pinned
    /// (only possible when the stream was unpinned).
    pub fn prepare_for_read(&mut self, delete_on_read: bool) -> crate::Result<bool> {
        debug_assert!(!self.closed);
        self.delete_on_read = delete_on_read;
        self.rows_returned = 0;
        self.read = None;

        if self.blocks.is_empty() {
            return Ok(true);
        }

        if !self.read_write {
            if let Some(write_block) = self.write_block.take() {
                debug_assert!(write_block.is_pinned());
                if !self.pinned && Some(&write_block) != self.blocks.front() {
                    self.unpin_stream_block(&write_block)?;
                }
                self.write_buf = None;
            }
        }

        // Pin the leading small blocks plus the first max-size block
        for block in &self.blocks {
            if !block.is_pinned() {
                if !block.pin()? {
                    return Ok(false);
                }
                self.num_pinned += 1;
            }
            if block.is_max_size() {
                break;
            }
        }

        let first = self.blocks.front().expect("blocks is non-empty").clone();
        self.read = Some(self.make_cursor(0, 0, &first)?);

        Ok(true)
    }

    fn make_cursor(
        &self,
        block: usize,
        block_ord: usize,
        handle: &BlockHandle,
    ) -> crate::Result<ReadCursor> {
        let buffer_len = handle.buffer_len();
        let null_indicator_bytes = self
            .compute_null_indicator_bytes(buffer_len)
            .expect("a written block holds at least one row");

        Ok(ReadCursor {
            block,
            block_ord,
            buf: handle.buffer()?,
            ptr: null_indicator_bytes,
            end: buffer_len,
            tuple_idx: 0,
        })
    }

    fn unpin_stream_block(&mut self, block: &BlockHandle) -> crate::Result<()> {
        debug_assert!(block.is_pinned());
        if !block.is_max_size() {
            return Ok(());
        }
        block.unpin()?;
        self.num_pinned -= 1;
        Ok(())
    }

    /// Advances the read cursor to the next block, recycling the previous
    /// one according to the stream mode.
    fn next_read_block(&mut self) -> crate::Result<()> {
        debug_assert!(!self.closed);
        let cursor = self.read.as_ref().expect("stream is prepared for read");
        let (mut next_idx, next_ord) = (cursor.block + 1, cursor.block_ord + 1);

        let current = self
            .blocks
            .get(cursor.block)
            .expect("read cursor is valid")
            .clone();

        let mut block_to_free =
            (!self.pinned || self.delete_on_read).then(|| current.clone());

        if self.delete_on_read {
            debug_assert_eq!(0, cursor.block);
            debug_assert!(Some(&current) != self.write_block.as_ref());

            self.blocks.pop_front();
            next_idx = 0;

            if !current.is_max_size() {
                // Small blocks are done for good
                self.num_small_blocks -= 1;
                current.clone().delete()?;
                block_to_free = None;
            }
        } else if let Some(freed) = &block_to_free {
            if !freed.is_max_size() {
                block_to_free = None;
            }
        }

        let next = self.blocks.get(next_idx).cloned();

        match &next {
            Some(next_block) if !next_block.is_pinned() => {
                // Pin the next block in tandem with releasing the old one,
                // so the freed buffer can serve the pin
                match block_to_free.take() {
                    Some(old) => {
                        // The released block and the fresh pin cancel out
                        // in the pinned count
                        let pinned = self.mgr.pin_block_with_release(
                            next_block,
                            &old,
                            !self.delete_on_read,
                        )?;
                        debug_assert!(pinned, "released buffer serves the pin");
                    }
                    None => {
                        let pinned = next_block.pin()?;
                        debug_assert!(pinned, "stream reservation covers the read block");
                        if pinned {
                            self.num_pinned += 1;
                        }
                    }
                }
            }
            _ => {
                // End of blocks or already pinned; just release the old one
                if let Some(old) = block_to_free.take() {
                    if self.delete_on_read {
                        old.delete()?;
                        self.num_pinned -= 1;
                    } else {
                        self.unpin_stream_block(&old)?;
                    }
                }
            }
        }

        self.read = match next {
            Some(next_block) if next_block.is_pinned() => {
                Some(self.make_cursor(next_idx, next_ord, &next_block)?)
            }
            _ => None,
        };

        Ok(())
    }

    /// Reads up to a batch worth of rows, optionally recording their
    /// stream positions.
    ///
    /// Returns `true` once all rows have been returned.
    pub fn get_next(
        &mut self,
        batch: &mut RowBatch,
        mut indices: Option<&mut Vec<RowIdx>>,
    ) -> crate::Result<bool> {
        debug_assert!(!self.closed);

        if self.rows_returned == self.num_rows {
            return Ok(true);
        }

        let tuples_per_row = self.desc.tuples_per_row();

        {
            let cursor = self.read.as_ref().expect("stream is prepared for read");
            let block = self.blocks.get(cursor.block).expect("read cursor is valid");
            let rows_returned_curr_block = cursor.tuple_idx / tuples_per_row.max(1);

            if rows_returned_curr_block == block.num_rows() {
                // Advancing here (not at the end of the previous call)
                // keeps the previous rows alive until the caller is done
                // with them
                self.next_read_block()?;
            }
        }

        let cursor = self.read.as_mut().expect("a block is readable");
        let block = self.blocks.get(cursor.block).expect("read cursor is valid");
        debug_assert!(block.is_pinned());

        let rows_returned_curr_block = cursor.tuple_idx / tuples_per_row.max(1);
        let rows_left_in_block = block.num_rows() - rows_returned_curr_block;
        let rows_to_fill = (batch.capacity() - batch.num_rows()).min(rows_left_in_block);
        debug_assert!(rows_to_fill >= 1);

        if let Some(indices) = indices.as_deref_mut() {
            debug_assert!(!self.delete_on_read);
            indices.clear();
            indices.reserve(rows_to_fill);
        }

        let desc = &self.desc;
        let has_nullable = self.has_nullable_tuple;
        let string_slots = &self.inlined_string_slots;
        let coll_slots = &self.inlined_coll_slots;
        let block_ord = cursor.block_ord;

        let mut ptr = cursor.ptr;
        let mut tuple_idx = cursor.tuple_idx;

        let decoded: crate::Result<Vec<Row>> = cursor.buf.with_data(|data| {
            let mut rows = Vec::with_capacity(rows_to_fill);

            for i in 0..rows_to_fill {
                if let Some(indices) = indices.as_deref_mut() {
                    indices.push(RowIdx {
                        block_idx: block_ord,
                        offset: ptr,
                        row_ord: rows_returned_curr_block + i,
                    });
                }

                let row = serde::decode_row(
                    data,
                    &mut ptr,
                    &mut tuple_idx,
                    desc,
                    has_nullable,
                    string_slots,
                    coll_slots,
                )?;
                rows.push(row);
            }

            Ok(rows)
        });
        let decoded = decoded?;

        debug_assert!(ptr <= cursor.end);
        cursor.ptr = ptr;
        cursor.tuple_idx = tuple_idx;

        for row in decoded {
            batch.add_row(row);
        }
        batch.commit_rows(rows_to_fill);

        self.rows_returned += rows_to_fill as u64;

        if (!self.pinned || self.delete_on_read)
            && rows_returned_curr_block + rows_to_fill == block.num_rows()
        {
            // The block is drained and about to be recycled
            batch.mark_need_to_return();
        }

        Ok(self.rows_returned == self.num_rows)
    }

    /// Decodes the row at `idx`. The stream must be pinned.
    pub fn get_row(&self, idx: &RowIdx) -> crate::Result<Row> {
        debug_assert!(self.pinned);
        debug_assert!(!self.delete_on_read);

        let block = self
            .blocks
            .get(idx.block_idx)
            .ok_or(crate::Error::StaleHandle)?;

        let tuples_per_row = self.desc.tuples_per_row();
        let mut ptr = idx.offset;
        let mut tuple_idx = idx.row_ord * tuples_per_row;

        block.with_data(|data| {
            serde::decode_row(
                data,
                &mut ptr,
                &mut tuple_idx,
                &self.desc,
                self.has_nullable_tuple,
                &self.inlined_string_slots,
                &self.inlined_coll_slots,
            )
        })?
    }

    /// Pins every block so the stream can be rescanned.
    ///
    /// Returns `false` (with no state change) if the required buffers are
    /// not currently available and `already_reserved` was not promised.
    pub fn pin_stream(&mut self, already_reserved: bool) -> crate::Result<bool> {
        debug_assert!(!self.closed);

        if !already_reserved
            && !self
                .mgr
                .try_acquire_tmp_reservation(self.client, self.blocks_unpinned() as i64)?
        {
            return Ok(false);
        }

        for block in &self.blocks {
            if block.is_pinned() {
                continue;
            }
            if !block.pin()? {
                log::debug!("stream pin failed despite reservation check");
                return Ok(false);
            }
            self.num_pinned += 1;
        }

        self.pinned = true;
        Ok(true)
    }

    /// Unpins blocks; with `all = false` the active read and write blocks
    /// stay resident.
    pub fn unpin_stream(&mut self, all: bool) -> crate::Result<()> {
        debug_assert!(!self.closed);

        let read_block = self
            .read
            .as_ref()
            .and_then(|r| self.blocks.get(r.block))
            .cloned();

        for block in self.blocks.clone() {
            if !block.is_pinned() {
                continue;
            }
            if !all
                && (Some(&block) == self.write_block.as_ref()
                    || (self.read_write && Some(&block) == read_block.as_ref()))
            {
                continue;
            }
            self.unpin_stream_block(&block)?;
        }

        if all {
            self.read = None;
            self.write_block = None;
            self.write_buf = None;
        }

        self.pinned = false;
        Ok(())
    }

    /// Pins the whole stream and drains it into a single batch.
    ///
    /// Returns `None` if the stream could not be pinned.
    pub fn get_rows(&mut self) -> crate::Result<Option<Vec<Row>>> {
        if !self.pin_stream(false)? {
            return Ok(None);
        }
        if !self.prepare_for_read(false)? {
            return Ok(None);
        }

        let mut batch = RowBatch::new((self.num_rows as usize).max(1));
        loop {
            let eos = self.get_next(&mut batch, None)?;
            if eos {
                break;
            }
        }

        Ok(Some(batch.take_rows()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block_mgr::BlockMgrRegistry,
        io::IoManager,
        mem::MemTracker,
        row::{ColumnType, RowDescriptor, SlotDescriptor, Tuple, TupleDescriptor, Value},
        tmp::TmpFileMgr,
    };
    use test_log::test;

    fn make_mgr(limit_blocks: i64, block_size: usize) -> Arc<BufferedBlockMgr> {
        let io = IoManager::new(1);
        let tmp = Arc::new(TmpFileMgr::new(1).expect("tmp dir is writable"));
        let tracker = MemTracker::root("query", -1);
        let registry = BlockMgrRegistry::new();
        registry
            .create(
                rand::random::<u64>(),
                &tracker,
                limit_blocks * block_size as i64,
                block_size,
                &io,
                &tmp,
            )
            .expect("create works")
    }

    fn int_string_desc() -> RowDescriptor {
        RowDescriptor::new(vec![TupleDescriptor::new(vec![
            SlotDescriptor::new(ColumnType::Int, vec![0]),
            SlotDescriptor::new(ColumnType::String, vec![1]),
        ])])
    }

    fn int_string_row(i: i32, s: &str) -> Row {
        Row::single(Tuple {
            values: vec![Value::Int(i), Value::String(s.as_bytes().to_vec())],
        })
    }

    #[test]
    fn stream_basic_round_trip() -> crate::Result<()> {
        let mgr = make_mgr(-1, 64 * 1024);
        let client = mgr.register_client(2, None);

        let mut stream =
            BufferedTupleStream::new(int_string_desc(), mgr.clone(), client, false, false);
        stream.init(true)?;

        for i in 0..100 {
            let row = int_string_row(i, &format!("value-{i}"));
            assert!(stream.add_row(&row)?);
        }
        assert_eq!(100, stream.num_rows());

        assert!(stream.prepare_for_read(false)?);

        let mut batch = RowBatch::new(32);
        let mut got = vec![];
        loop {
            batch.clear();
            let eos = stream.get_next(&mut batch, None)?;
            got.extend(batch.rows().iter().cloned());
            if eos {
                break;
            }
        }

        assert_eq!(100, got.len());
        for (i, row) in got.iter().enumerate() {
            assert_eq!(&int_string_row(i as i32, &format!("value-{i}")), row);
        }

        stream.close();
        Ok(())
    }

    #[test]
    fn stream_small_buffers_bootstrap() -> crate::Result<()> {
        let mgr = make_mgr(-1, 8 * 1024 * 1024);
        let client = mgr.register_client(1, None);

        let mut stream =
            BufferedTupleStream::new(int_string_desc(), mgr.clone(), client, true, false);
        stream.init(true)?;

        // First block is the 64 KiB bootstrap buffer
        assert!(stream.using_small_buffers());
        assert_eq!(64 * 1024, stream.byte_size());

        let row = int_string_row(1, "x");
        assert!(stream.add_row(&row)?);

        assert!(stream.switch_to_io_buffers()?);
        assert!(!stream.using_small_buffers());
        assert!(stream.add_row(&row)?);

        // Nothing spilled: small buffers never hit the disk
        assert_eq!(0, mgr.writes_issued());

        stream.close();
        Ok(())
    }

    #[test]
    fn stream_nullable_tuple_round_trip() -> crate::Result<()> {
        let mgr = make_mgr(-1, 64 * 1024);
        let client = mgr.register_client(2, None);

        let desc = RowDescriptor::new(vec![
            TupleDescriptor::new(vec![SlotDescriptor::new(ColumnType::BigInt, vec![0])]),
            TupleDescriptor::new(vec![SlotDescriptor::new(ColumnType::Int, vec![1])]).nullable(),
        ]);

        let mut stream = BufferedTupleStream::new(desc, mgr, client, false, false);
        stream.init(true)?;

        let mut rows = vec![];
        for i in 0..50i64 {
            let left = Tuple {
                values: vec![Value::BigInt(i)],
            };
            let right = (i % 3 != 0).then(|| Tuple {
                values: vec![Value::Int(i as i32 * 10)],
            });
            rows.push(Row {
                tuples: vec![Some(left), right],
            });
        }

        for row in &rows {
            assert!(stream.add_row(row)?);
        }

        let got = stream.get_rows()?.expect("stream pins");
        assert_eq!(rows, got);

        stream.close();
        Ok(())
    }
}
