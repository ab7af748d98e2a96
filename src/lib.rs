// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Storage and spill engine for a columnar MPP query runtime.
//!
//! ##### About
//!
//! This crate provides the memory-and-disk substrate a query fragment
//! runs on, not a query engine: the SQL frontend, scheduler and
//! expression evaluation live elsewhere and talk to these types through
//! narrow interfaces.
//!
//! Three tightly-coupled subsystems form the core:
//!
//! - [`block_mgr::BufferedBlockMgr`] — a per-query spilling memory pool
//!   that lends fixed-size blocks to multiple clients under a strict
//!   budget, transparently writing cold blocks to temporary files when
//!   memory is tight.
//! - [`stream::BufferedTupleStream`] — an append-only, read-once (or
//!   pin-and-rescan) stream of rows layered over the block manager, with
//!   a compact in-block encoding for variable-length payloads and
//!   nullable tuples.
//! - [`parquet::ParquetFileReader`] — a decoder transforming a Parquet
//!   row group into tuples, driven by per-column state machines over
//!   definition/repetition levels.
//!
//! A cache-line-resident [`filter::BlockBloomFilter`] rounds out the set;
//! it is built by the hash-join build side and probed during scans.
//!
//! # Example
//!
//! ```
//! use spill_engine::filter::BlockBloomFilter;
//!
//! // Size the filter for 10k distinct values at 1% false positives
//! let log_space = BlockBloomFilter::min_log_space(10_000, 0.01);
//! let mut filter = BlockBloomFilter::new(log_space);
//!
//! filter.insert(0xDEAD_BEEF);
//! assert!(filter.find(0xDEAD_BEEF));
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

pub mod block_mgr;

#[doc(hidden)]
pub mod codec;

mod coding;

mod error;

pub mod filter;

#[doc(hidden)]
pub mod io;

pub mod mem;

pub mod parquet;

pub mod row;

pub mod stream;

#[doc(hidden)]
pub mod tmp;

mod util;

pub use {
    block_mgr::{BlockHandle, BlockMgrRegistry, BufferedBlockMgr, Client},
    codec::{CompressionCodec, Decompressor},
    coding::{Decode, DecodeError, Encode},
    error::{Error, Result},
    filter::{BlockBloomFilter, WireBloomFilter},
    io::IoManager,
    mem::MemTracker,
    parquet::{ParquetFileReader, ParquetReaderOptions},
    row::{RowBatch, RowDescriptor, TupleDescriptor},
    stream::{BufferedTupleStream, RowIdx},
    tmp::TmpFileMgr,
};
