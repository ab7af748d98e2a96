// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression codec of a Parquet column chunk
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompressionCodec {
    /// No compression
    Uncompressed,

    /// Snappy compression
    Snappy,

    /// Gzip compression
    Gzip,

    /// Any codec the engine does not support (kept so validation can
    /// name it in the error)
    Other(u8),
}

impl CompressionCodec {
    #[must_use]
    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl Encode for CompressionCodec {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Self::Uncompressed => writer.write_u8(0),
            Self::Snappy => writer.write_u8(1),
            Self::Gzip => writer.write_u8(2),
            Self::Other(tag) => writer.write_u8(*tag),
        }
    }
}

impl Decode for CompressionCodec {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        Ok(match tag {
            0 => Self::Uncompressed,
            1 => Self::Snappy,
            2 => Self::Gzip,
            tag => Self::Other(tag),
        })
    }
}

impl std::fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncompressed => write!(f, "uncompressed"),
            Self::Snappy => write!(f, "snappy"),
            Self::Gzip => write!(f, "gzip"),
            Self::Other(tag) => write!(f, "unknown({tag})"),
        }
    }
}

/// Streaming decompressor for page payloads.
///
/// One decompressor is created per column chunk and reused across its pages.
#[derive(Debug)]
pub struct Decompressor {
    codec: CompressionCodec,
}

impl Decompressor {
    /// Creates a decompressor for `codec`.
    ///
    /// Returns `None` for [`CompressionCodec::Uncompressed`]; errors on
    /// codecs outside the supported set.
    pub fn create(codec: CompressionCodec) -> crate::Result<Option<Self>> {
        match codec {
            CompressionCodec::Uncompressed => Ok(None),
            CompressionCodec::Snappy | CompressionCodec::Gzip => Ok(Some(Self { codec })),
            CompressionCodec::Other(_) => Err(crate::Error::UnsupportedSchema(format!(
                "unsupported compression codec: {codec}",
            ))),
        }
    }

    #[must_use]
    pub fn codec(&self) -> CompressionCodec {
        self.codec
    }

    /// Decompresses `input`, checking the result against the size the page
    /// header declared.
    pub fn process_block(&self, input: &[u8], uncompressed_size: usize) -> crate::Result<Vec<u8>> {
        let out = match self.codec {
            CompressionCodec::Snappy => snap::raw::Decoder::new()
                .decompress_vec(input)
                .map_err(|e| {
                    log::warn!("snappy decompression failed: {e}");
                    crate::Error::Decompress(self.codec)
                })?,

            CompressionCodec::Gzip => {
                let mut out = Vec::with_capacity(uncompressed_size);
                let mut decoder = flate2::read::GzDecoder::new(input);
                decoder.read_to_end(&mut out).map_err(|e| {
                    log::warn!("gzip decompression failed: {e}");
                    crate::Error::Decompress(self.codec)
                })?;
                out
            }

            CompressionCodec::Uncompressed | CompressionCodec::Other(_) => {
                unreachable!("no decompressor is created for {}", self.codec)
            }
        };

        if out.len() != uncompressed_size {
            return Err(crate::Error::Decompress(self.codec));
        }

        Ok(out)
    }
}
