// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};
use tempfile::TempDir;

/// Manages ephemeral spill files, one directory per spill device.
///
/// Files are append-only at the allocation level: space is handed out by
/// bumping a per-file offset, and the actual writes land at those offsets
/// through the I/O manager. Nothing in a spill file survives the query.
pub struct TmpFileMgr {
    dir: TempDir,
    num_devices: usize,
    file_counter: AtomicU64,
}

impl std::fmt::Debug for TmpFileMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TmpFileMgr({:?}, {} devices)",
            self.dir.path(),
            self.num_devices,
        )
    }
}

impl TmpFileMgr {
    /// Creates a manager with `num_devices` simulated spill devices backed
    /// by a fresh temporary directory.
    pub fn new(num_devices: usize) -> crate::Result<Self> {
        assert!(num_devices > 0, "need at least one spill device");

        let dir = tempfile::tempdir()?;

        for device_id in 0..num_devices {
            std::fs::create_dir_all(dir.path().join(format!("dev-{device_id}")))?;
        }

        Ok(Self {
            dir,
            num_devices,
            file_counter: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Creates a new spill file on `device_id` for the given query.
    pub fn get_file(&self, device_id: usize, query_id: u64) -> crate::Result<TmpFile> {
        assert!(device_id < self.num_devices);

        let seq = self.file_counter.fetch_add(1, Ordering::AcqRel);
        let path = self
            .dir
            .path()
            .join(format!("dev-{device_id}"))
            .join(format!("query-{query_id:x}-{seq}.spill"));

        std::fs::File::create(&path)?;

        log::trace!("created spill file {path:?}");

        Ok(TmpFile {
            path,
            device_id,
            next_offset: AtomicU64::new(0),
        })
    }
}

/// One ephemeral append-only spill file
#[derive(Debug)]
pub struct TmpFile {
    path: PathBuf,
    device_id: usize,
    next_offset: AtomicU64,
}

impl TmpFile {
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    #[must_use]
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Reserves `len` bytes, returning the offset they begin at.
    #[must_use]
    pub fn allocate_space(&self, len: u64) -> u64 {
        self.next_offset.fetch_add(len, Ordering::AcqRel)
    }

    /// Bytes allocated so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes the file from disk.
    pub fn remove(&self) -> crate::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn tmp_file_allocate_space() -> crate::Result<()> {
        let mgr = TmpFileMgr::new(2)?;
        assert_eq!(2, mgr.num_devices());

        let file = mgr.get_file(1, 42)?;
        assert_eq!(0, file.allocate_space(8192));
        assert_eq!(8192, file.allocate_space(8192));
        assert_eq!(16384, file.len());
        assert!(file.path().exists());

        file.remove()?;
        assert!(!file.path().exists());

        Ok(())
    }

    #[test]
    fn tmp_file_names_are_unique() -> crate::Result<()> {
        let mgr = TmpFileMgr::new(1)?;
        let a = mgr.get_file(0, 7)?;
        let b = mgr.get_file(0, 7)?;
        assert_ne!(a.path(), b.path());
        Ok(())
    }
}
