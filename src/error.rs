// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{codec::CompressionCodec, coding::DecodeError};

/// Represents errors that can occur in the storage & decode engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// The query was cancelled; every subsequent operation on the
    /// same block manager returns this
    Cancelled,

    /// A required buffer could not be served, even after eviction
    MemLimitExceeded(String),

    /// A single row plus its null-indicator bytes cannot fit into any
    /// block (row size, null indicator size)
    BlockOverflow(usize, usize),

    /// A block handle was used after its block was deleted and its
    /// slot recycled
    StaleHandle,

    /// Parquet metadata violated a structural invariant
    /// (e.g. two dictionary pages, value count mismatch, header EOF)
    Corrupt(String),

    /// Encoding, codec, repetition type or decimal metadata outside
    /// the supported set
    UnsupportedSchema(String),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionCodec),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SpillEngineError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
