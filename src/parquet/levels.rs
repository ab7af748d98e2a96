// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Definition/repetition level decoding: the RLE/bit-packing hybrid and
//! the legacy whole-page bit-packed form. Also the plain bit reader used
//! for PLAIN-encoded booleans.

use std::sync::Arc;

/// Shared, immutable page payload.
///
/// Decoders address ranges of one page without copying it.
pub type PageData = Arc<Vec<u8>>;

fn read_bits_at(data: &[u8], bit_pos: usize, num_bits: u32) -> Option<u64> {
    let mut value = 0u64;
    for i in 0..num_bits as usize {
        let pos = bit_pos + i;
        let byte = data.get(pos >> 3)?;
        let bit = u64::from((byte >> (pos & 7)) & 1);
        value |= bit << i;
    }
    Some(value)
}

/// Sequential LSB-first bit reader over a page range
#[derive(Debug)]
pub struct BitReader {
    data: PageData,
    bit_pos: usize,
    bit_end: usize,
}

impl BitReader {
    #[must_use]
    pub fn new(data: PageData, start: usize, len: usize) -> Self {
        Self {
            data,
            bit_pos: start * 8,
            bit_end: (start + len) * 8,
        }
    }

    /// Reads the next `num_bits` bits as an unsigned value.
    pub fn get_value(&mut self, num_bits: u32) -> Option<u64> {
        if self.bit_pos + num_bits as usize > self.bit_end {
            return None;
        }
        let value = read_bits_at(&self.data, self.bit_pos, num_bits)?;
        self.bit_pos += num_bits as usize;
        Some(value)
    }

    pub fn get_bool(&mut self) -> Option<bool> {
        self.get_value(1).map(|v| v != 0)
    }
}

/// Decoder for the RLE/bit-packing hybrid
#[derive(Debug)]
pub struct RleDecoder {
    data: PageData,

    /// Next unread byte (runs are byte aligned)
    pos: usize,
    end: usize,

    bit_width: u32,

    repeat_count: usize,
    current_value: u64,

    literal_count: usize,
    literal_bit_pos: usize,
}

impl RleDecoder {
    #[must_use]
    pub fn new(data: PageData, start: usize, len: usize, bit_width: u32) -> Self {
        debug_assert!(bit_width <= 32);

        Self {
            data,
            pos: start,
            end: start + len,
            bit_width,
            repeat_count: 0,
            current_value: 0,
            literal_count: 0,
            literal_bit_pos: 0,
        }
    }

    /// Returns the next value, or `None` when the input is exhausted or
    /// malformed.
    pub fn get(&mut self) -> Option<u64> {
        if self.repeat_count == 0 && self.literal_count == 0 && !self.next_run() {
            return None;
        }

        if self.repeat_count > 0 {
            self.repeat_count -= 1;
            return Some(self.current_value);
        }

        debug_assert!(self.literal_count > 0);
        self.literal_count -= 1;

        let value = read_bits_at(&self.data, self.literal_bit_pos, self.bit_width)?;
        self.literal_bit_pos += self.bit_width as usize;
        Some(value)
    }

    /// ULEB128 run header.
    fn read_vlq(&mut self) -> Option<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;

        loop {
            if self.pos >= self.end || shift >= 64 {
                return None;
            }
            let byte = *self.data.get(self.pos)?;
            self.pos += 1;

            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
        }
    }

    fn next_run(&mut self) -> bool {
        if self.pos >= self.end {
            return false;
        }

        let Some(header) = self.read_vlq() else {
            return false;
        };

        if header & 1 == 1 {
            // Bit-packed groups of 8 values
            let num_groups = (header >> 1) as usize;
            if num_groups == 0 {
                return false;
            }

            let byte_len = num_groups * self.bit_width as usize;
            if self.pos + byte_len > self.end {
                return false;
            }

            self.literal_count = num_groups * 8;
            self.literal_bit_pos = self.pos * 8;
            self.pos += byte_len;
        } else {
            // Repeated run; value stored in ceil(bit_width / 8) bytes
            let count = (header >> 1) as usize;
            if count == 0 {
                return false;
            }

            let width_bytes = (self.bit_width as usize).div_ceil(8);
            if self.pos + width_bytes > self.end {
                return false;
            }

            let mut value = 0u64;
            for i in 0..width_bytes {
                let Some(byte) = self.data.get(self.pos + i) else {
                    return false;
                };
                value |= u64::from(*byte) << (8 * i);
            }
            self.pos += width_bytes;

            self.repeat_count = count;
            self.current_value = value;
        }

        true
    }
}

/// Per-page decoder for one level stream; the variant follows the page
/// header's declared encoding
#[derive(Debug)]
pub enum LevelDecoder {
    Rle(RleDecoder),
    BitPacked(BitReader),
}

impl LevelDecoder {
    pub fn get(&mut self) -> Option<u8> {
        match self {
            Self::Rle(decoder) => decoder.get().map(|v| v as u8),
            Self::BitPacked(reader) => reader.get_value(1).map(|v| v as u8),
        }
    }
}

/// RLE/bit-packing hybrid encoder, used to produce test pages and kept
/// format-compatible with the decoder above.
#[cfg(test)]
pub mod encode {
    /// Encodes `values` with the given bit width, emitting repeated runs
    /// for runs of equal values and bit-packed groups otherwise.
    #[must_use]
    pub fn rle_encode(values: &[u64], bit_width: u32) -> Vec<u8> {
        let mut out = vec![];
        let mut i = 0;

        while i < values.len() {
            // Measure the run of equal values
            let run_value = values[i];
            let mut run_len = 1;
            while i + run_len < values.len() && values[i + run_len] == run_value {
                run_len += 1;
            }

            if run_len >= 8 {
                write_vlq(&mut out, (run_len as u64) << 1);
                let width_bytes = (bit_width as usize).div_ceil(8);
                for b in 0..width_bytes {
                    out.push((run_value >> (8 * b)) as u8);
                }
                i += run_len;
            } else {
                // Bit-pack the next group of (up to) 8 values, padding
                // the tail with zeroes
                let group: Vec<u64> = (0..8)
                    .map(|j| values.get(i + j).copied().unwrap_or(0))
                    .collect();

                write_vlq(&mut out, 1 | (1 << 1));
                out.extend(bit_pack(&group, bit_width));
                i += 8.min(values.len() - i);
            }
        }

        out
    }

    /// LSB-first bit packing.
    #[must_use]
    pub fn bit_pack(values: &[u64], bit_width: u32) -> Vec<u8> {
        let total_bits = values.len() * bit_width as usize;
        let mut out = vec![0u8; total_bits.div_ceil(8)];

        let mut bit_pos = 0;
        for &value in values {
            for b in 0..bit_width as usize {
                if (value >> b) & 1 != 0 {
                    out[bit_pos >> 3] |= 1 << (bit_pos & 7);
                }
                bit_pos += 1;
            }
        }

        out
    }

    fn write_vlq(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn levels_rle_repeated_runs() {
        // 10x value 1, then 3x value 0 (hand-encoded)
        let bytes = Arc::new(vec![
            20, 1, // header 10 << 1, value 1
            6, 0, // header 3 << 1, value 0
        ]);

        let mut decoder = RleDecoder::new(bytes.clone(), 0, bytes.len(), 1);
        for _ in 0..10 {
            assert_eq!(Some(1), decoder.get());
        }
        for _ in 0..3 {
            assert_eq!(Some(0), decoder.get());
        }
        assert_eq!(None, decoder.get());
    }

    #[test]
    fn levels_rle_literal_run() {
        // One bit-packed group of 8 one-bit values: 1,0,1,1,0,0,1,0
        // header = (1 << 1) | 1 = 3; packed byte LSB-first = 0b0100_1101
        let bytes = Arc::new(vec![3, 0b0100_1101]);

        let mut decoder = RleDecoder::new(bytes.clone(), 0, bytes.len(), 1);
        let got: Vec<u64> = std::iter::from_fn(|| decoder.get()).collect();
        assert_eq!(vec![1, 0, 1, 1, 0, 0, 1, 0], got);
    }

    #[test]
    fn levels_rle_encoder_round_trip() {
        let values: Vec<u64> = (0..1000).map(|i| u64::from(i % 7 == 0)).collect();

        let bytes = Arc::new(encode::rle_encode(&values, 1));
        let mut decoder = RleDecoder::new(bytes.clone(), 0, bytes.len(), 1);

        for &expected in &values {
            assert_eq!(Some(expected), decoder.get());
        }
    }

    #[test]
    fn levels_rle_wide_values_round_trip() {
        let values: Vec<u64> = (0..500).map(|i| i % 23).collect();

        let bytes = Arc::new(encode::rle_encode(&values, 5));
        let mut decoder = RleDecoder::new(bytes.clone(), 0, bytes.len(), 5);

        for &expected in &values {
            assert_eq!(Some(expected), decoder.get());
        }
    }

    #[test]
    fn levels_bit_reader() {
        let bytes = Arc::new(encode::bit_pack(&[5, 2, 7, 0, 3], 3));

        let mut reader = BitReader::new(bytes.clone(), 0, bytes.len());
        assert_eq!(Some(5), reader.get_value(3));
        assert_eq!(Some(2), reader.get_value(3));
        assert_eq!(Some(7), reader.get_value(3));
        assert_eq!(Some(0), reader.get_value(3));
        assert_eq!(Some(3), reader.get_value(3));
        assert_eq!(None, reader.get_value(3));
    }

    #[test]
    fn levels_rle_truncated_input() {
        // Repeated-run header promising a value byte that is missing
        let bytes = Arc::new(vec![20]);
        let mut decoder = RleDecoder::new(bytes.clone(), 0, bytes.len(), 1);
        assert_eq!(None, decoder.get());
    }
}
