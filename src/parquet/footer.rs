// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Footer acquisition: a tail prefetch sized for the common case, with
//! stitching reads when the metadata outgrows the prefetched window.
//!
//! Layout from the end of the file:
//! `<metadata bytes> <4-byte little-endian metadata length> <"PAR1">`.

use super::format::{FileMetaData, PARQUET_MAGIC};
use crate::{
    coding::Decode,
    io::{IoContext, IoManager},
};
use std::path::Path;

/// Magic plus the metadata length word
const FOOTER_TRAILER_SIZE: u64 = PARQUET_MAGIC.len() as u64 + 4;

/// Reads and decodes the file metadata from the footer.
pub fn read_file_metadata(
    io: &IoManager,
    ctx: &IoContext,
    path: &Path,
    file_len: u64,
    footer_prefetch: u64,
) -> crate::Result<FileMetaData> {
    if file_len < FOOTER_TRAILER_SIZE {
        return Err(crate::Error::Corrupt(format!(
            "file {path:?} is invalid: missing metadata",
        )));
    }

    let prefetch = footer_prefetch.max(FOOTER_TRAILER_SIZE).min(file_len);
    let buffer = io.read(ctx, path, file_len - prefetch, prefetch as usize)?;

    let magic = buffer
        .get(buffer.len() - PARQUET_MAGIC.len()..)
        .expect("buffer holds at least the trailer");
    if magic != PARQUET_MAGIC {
        return Err(crate::Error::Corrupt(format!(
            "file {path:?} is invalid: bad file footer magic {magic:?}",
        )));
    }

    let size_field = buffer
        .get(buffer.len() - FOOTER_TRAILER_SIZE as usize..buffer.len() - PARQUET_MAGIC.len())
        .expect("buffer holds at least the trailer");
    let metadata_size =
        u64::from(u32::from_le_bytes(size_field.try_into().expect("4 bytes")));

    let buffered = prefetch - FOOTER_TRAILER_SIZE;

    let metadata_bytes: Vec<u8> = if metadata_size > buffered {
        // The metadata is bigger than the prefetch window; stitch it
        // together from additional fixed-size reads
        let Some(metadata_start) =
            (file_len - FOOTER_TRAILER_SIZE).checked_sub(metadata_size)
        else {
            return Err(crate::Error::Corrupt(format!(
                "file {path:?} is invalid: metadata size {metadata_size} exceeds file size {file_len}",
            )));
        };

        let mut stitched = Vec::with_capacity(metadata_size as usize);
        let mut remaining = metadata_size;
        let mut offset = metadata_start;

        while remaining > 0 {
            let to_read = remaining.min(io.max_read_buffer_size() as u64);
            stitched.extend(io.read(ctx, path, offset, to_read as usize)?);
            remaining -= to_read;
            offset += to_read;
        }

        stitched
    } else {
        let start = buffer.len() - FOOTER_TRAILER_SIZE as usize - metadata_size as usize;
        buffer
            .get(start..buffer.len() - FOOTER_TRAILER_SIZE as usize)
            .expect("window was checked")
            .to_vec()
    };

    FileMetaData::decode_from(&mut metadata_bytes.as_slice()).map_err(|e| {
        crate::Error::Corrupt(format!("file {path:?} has invalid file metadata: {e}"))
    })
}

#[cfg(test)]
pub mod testwriter {
    //! Assembles wire-correct files for the reader tests.

    use super::*;
    use crate::coding::Encode;
    use std::io::Write;

    /// Appends the footer (metadata, length word, magic) to `body` and
    /// returns the complete file image.
    pub fn finish_file(mut body: Vec<u8>, metadata: &FileMetaData) -> Vec<u8> {
        let metadata_bytes = metadata.encode_into_vec();

        body.extend_from_slice(&metadata_bytes);
        body.write_all(&(metadata_bytes.len() as u32).to_le_bytes())
            .expect("writing to a vec cannot fail");
        body.extend_from_slice(&PARQUET_MAGIC);
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parquet::format::{Repetition, SchemaElement};
    use test_log::test;

    fn sample_metadata() -> FileMetaData {
        FileMetaData {
            version: 1,
            schema: vec![SchemaElement::group("schema", Repetition::Required, 0)],
            num_rows: 0,
            row_groups: vec![],
            created_by: Some("impala version 2.2.0".into()),
        }
    }

    fn write_file(dir: &Path, name: &str, image: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, image).expect("tmp dir is writable");
        path
    }

    #[test]
    fn footer_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let metadata = sample_metadata();
        let image = testwriter::finish_file(vec![0xAB; 64], &metadata);
        let path = write_file(dir.path(), "ok.parquet", &image);

        let io = IoManager::new(1);
        let ctx = io.register_context();

        let decoded =
            read_file_metadata(&io, &ctx, &path, image.len() as u64, 100 * 1024)?;
        assert_eq!(metadata, decoded);

        Ok(())
    }

    #[test]
    fn footer_stitches_oversized_metadata() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        // Blow up the metadata beyond the prefetch window
        let mut metadata = sample_metadata();
        metadata.created_by = Some("x".repeat(4096));

        let image = testwriter::finish_file(vec![0xCD; 16], &metadata);
        let path = write_file(dir.path(), "big.parquet", &image);

        let io = IoManager::new(1);
        let ctx = io.register_context();

        // Prefetch much smaller than the metadata
        let decoded = read_file_metadata(&io, &ctx, &path, image.len() as u64, 64)?;
        assert_eq!(metadata, decoded);

        Ok(())
    }

    #[test]
    fn footer_bad_magic_fails() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut image = testwriter::finish_file(vec![], &sample_metadata());
        let len = image.len();
        image.get_mut(len - 1..).expect("non-empty").fill(b'X');
        let path = write_file(dir.path(), "bad.parquet", &image);

        let io = IoManager::new(1);
        let ctx = io.register_context();

        assert!(matches!(
            read_file_metadata(&io, &ctx, &path, len as u64, 1024),
            Err(crate::Error::Corrupt(_))
        ));

        Ok(())
    }

    #[test]
    fn footer_truncated_file_fails() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_file(dir.path(), "tiny.parquet", b"PA");

        let io = IoManager::new(1);
        let ctx = io.register_context();

        assert!(matches!(
            read_file_metadata(&io, &ctx, &path, 2, 1024),
            Err(crate::Error::Corrupt(_))
        ));

        Ok(())
    }
}
