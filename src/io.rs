// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::JoinHandle,
};

/// Default cap for a single read issued by the manager
const DEFAULT_MAX_READ_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// A fixed-capacity byte buffer shared between the block manager and the
/// I/O workers.
///
/// The buffer's own lock is only ever contended between the single thread
/// that currently owns the attached block and one in-flight write, which the
/// block manager serializes via its single-writer token.
pub struct IoBuffer {
    data: Mutex<Box<[u8]>>,
    capacity: usize,
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoBuffer({}B)", self.capacity)
    }
}

impl IoBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes.
    #[must_use]
    pub fn alloc(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Runs `f` over the buffer contents.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.data.lock().expect("lock is poisoned");
        f(&guard)
    }

    /// Runs `f` over the mutable buffer contents.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.data.lock().expect("lock is poisoned");
        f(&mut guard)
    }
}

/// Registration of one consumer (e.g. a block manager) with the I/O manager.
///
/// Cancellation is level-triggered: once cancelled, queued operations for
/// this context complete with [`crate::Error::Cancelled`] without touching
/// the disk, while operations already in flight run to completion.
#[derive(Clone, Debug)]
pub struct IoContext {
    cancelled: Arc<AtomicBool>,
}

impl IoContext {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Target location of one spilled block
#[derive(Clone, Debug)]
pub struct WriteRange {
    pub file: PathBuf,
    pub offset: u64,
    pub disk_id: usize,
}

/// Completion callback of an asynchronous write
pub type WriteCallback = Box<dyn FnOnce(crate::Result<()>) + Send + 'static>;

struct WriteOp {
    range: WriteRange,
    buf: Arc<IoBuffer>,
    len: usize,
    ctx: IoContext,
    callback: WriteCallback,
}

struct DiskQueue {
    tx: mpsc::Sender<WriteOp>,
}

/// Thread-per-disk I/O manager.
///
/// Writes are submitted without blocking and complete through a callback on
/// the disk's worker thread. Reads are synchronous.
pub struct IoManager {
    disks: Vec<DiskQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_read_buffer_size: usize,
    queued_writes: Arc<AtomicUsize>,
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoManager({} disks)", self.disks.len())
    }
}

impl IoManager {
    /// Starts one worker thread per disk.
    #[must_use]
    pub fn new(num_disks: usize) -> Arc<Self> {
        assert!(num_disks > 0, "need at least one disk");

        let queued_writes = Arc::new(AtomicUsize::new(0));

        let mut disks = Vec::with_capacity(num_disks);
        let mut workers = Vec::with_capacity(num_disks);

        for disk_id in 0..num_disks {
            let (tx, rx) = mpsc::channel::<WriteOp>();
            let queued = queued_writes.clone();

            let handle = std::thread::Builder::new()
                .name(format!("spill-io-{disk_id}"))
                .spawn(move || {
                    while let Ok(op) = rx.recv() {
                        let result = if op.ctx.is_cancelled() {
                            Err(crate::Error::Cancelled)
                        } else {
                            perform_write(&op).map_err(crate::Error::from)
                        };
                        queued.fetch_sub(1, Ordering::AcqRel);
                        (op.callback)(result);
                    }
                })
                .expect("should be able to spawn I/O worker");

            disks.push(DiskQueue { tx });
            workers.push(handle);
        }

        Arc::new(Self {
            disks,
            workers: Mutex::new(workers),
            max_read_buffer_size: DEFAULT_MAX_READ_BUFFER_SIZE,
            queued_writes,
        })
    }

    #[must_use]
    pub fn num_disks(&self) -> usize {
        self.disks.len()
    }

    #[must_use]
    pub fn max_read_buffer_size(&self) -> usize {
        self.max_read_buffer_size
    }

    /// Registers a new consumer.
    #[must_use]
    pub fn register_context(&self) -> IoContext {
        IoContext {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancels a context, failing its queued operations.
    pub fn cancel_context(&self, ctx: &IoContext) {
        ctx.cancelled.store(true, Ordering::Release);
    }

    /// Submits an asynchronous write of `len` bytes from `buf` to the range.
    ///
    /// The callback is invoked exactly once from a worker thread.
    pub fn add_write_range(
        &self,
        ctx: &IoContext,
        range: WriteRange,
        buf: Arc<IoBuffer>,
        len: usize,
        callback: WriteCallback,
    ) -> crate::Result<()> {
        if ctx.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }

        debug_assert!(len <= buf.capacity());

        let disk = self
            .disks
            .get(range.disk_id % self.disks.len())
            .expect("disk id is taken modulo disk count");

        self.queued_writes.fetch_add(1, Ordering::AcqRel);

        disk.tx
            .send(WriteOp {
                range,
                buf,
                len,
                ctx: ctx.clone(),
                callback,
            })
            .map_err(|_| {
                self.queued_writes.fetch_sub(1, Ordering::AcqRel);
                crate::Error::Cancelled
            })
    }

    /// Synchronously reads `out.len()` bytes at `offset` of `path`.
    pub fn read_into(
        &self,
        ctx: &IoContext,
        path: &std::path::Path,
        offset: u64,
        out: &mut [u8],
    ) -> crate::Result<()> {
        if ctx.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }

        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(out)?;

        Ok(())
    }

    /// Synchronously reads `len` bytes at `offset` of `path`.
    pub fn read(
        &self,
        ctx: &IoContext,
        path: &std::path::Path,
        offset: u64,
        len: usize,
    ) -> crate::Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_into(ctx, path, offset, &mut out)?;
        Ok(out)
    }

    /// Number of writes submitted but not yet completed, across all disks.
    #[must_use]
    pub fn queued_write_count(&self) -> usize {
        self.queued_writes.load(Ordering::Acquire)
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Closing the senders lets the workers drain and exit
        self.disks.clear();

        let workers = std::mem::take(&mut *self.workers.lock().expect("lock is poisoned"));

        for handle in workers {
            if handle.join().is_err() {
                log::error!("I/O worker panicked");
            }
        }
    }
}

fn perform_write(op: &WriteOp) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&op.range.file)?;

    file.seek(SeekFrom::Start(op.range.offset))?;

    op.buf.with_data(|data| {
        let valid = data.get(..op.len).expect("len is within buffer capacity");
        file.write_all(valid)
    })?;

    file.sync_data()?;

    log::trace!(
        "wrote {}B to {:?} at offset {}",
        op.len,
        op.range.file,
        op.range.offset,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use test_log::test;

    #[test]
    fn io_write_then_read() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scratch");
        std::fs::File::create(&path)?;

        let io = IoManager::new(2);
        let ctx = io.register_context();

        let buf = IoBuffer::alloc(64);
        buf.with_data_mut(|data| {
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = i as u8;
            }
        });

        let (tx, rx) = channel();
        io.add_write_range(
            &ctx,
            WriteRange {
                file: path.clone(),
                offset: 128,
                disk_id: 1,
            },
            buf,
            64,
            Box::new(move |result| {
                tx.send(result).expect("receiver is alive");
            }),
        )?;

        rx.recv().expect("callback fires")?;

        let read_back = io.read(&ctx, &path, 128, 64)?;
        assert_eq!(
            (0..64).map(|i| i as u8).collect::<Vec<_>>(),
            read_back,
        );

        Ok(())
    }

    #[test]
    fn io_cancelled_context_fails_queued_writes() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scratch");
        std::fs::File::create(&path)?;

        let io = IoManager::new(1);
        let ctx = io.register_context();
        io.cancel_context(&ctx);

        let buf = IoBuffer::alloc(8);
        let result = io.add_write_range(
            &ctx,
            WriteRange {
                file: path,
                offset: 0,
                disk_id: 0,
            },
            buf,
            8,
            Box::new(|_| {}),
        );

        assert!(matches!(result, Err(crate::Error::Cancelled)));

        Ok(())
    }
}
