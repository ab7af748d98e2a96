// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Number of 64-bit words per bucket (one cache line)
const BUCKET_WORDS: usize = 8;

/// log2(bits per bucket word)
const LOG_BUCKET_WORD_BITS: u32 = 6;

const BUCKET_WORD_MASK: u64 = (1 << LOG_BUCKET_WORD_BITS) - 1;

/// log2(bytes per bucket)
const LOG_BUCKET_BYTE_SIZE: u32 = 6;

/// One cache line worth of filter bits
type Bucket = [u64; BUCKET_WORDS];

// Multiplicative rehashing; the inserted hash only needs low collision
// probability, these spread it to pick the bucket and the bit pattern.

fn rehash32to32(hash: u32) -> u32 {
    const M: u64 = 0x7850_f11e_c6d1_4889;
    const A: u64 = 0x6773_6105_97ca_4c63;
    ((A.wrapping_add(M.wrapping_mul(u64::from(hash)))) >> 32) as u32
}

fn rehash32to64(hash: u32) -> u64 {
    const M1: u64 = 0x47b6_137a_4497_4d91;
    const M2: u64 = 0x8824_ad5b_a2b7_289c;
    const A1: u64 = 0x7054_95c6_2df1_424b;
    const A2: u64 = 0x9efc_4947_5c6b_fb31;
    let h1 = (A1.wrapping_add(M1.wrapping_mul(u64::from(hash)))) >> 32;
    let h2 = (A2.wrapping_add(M2.wrapping_mul(u64::from(hash)))) >> 32;
    h1 | (h2 << 32)
}

/// A cache-line blocked Bloom filter.
///
/// The inserted hash picks a single cache-line-sized bucket, which is then
/// treated as a tiny Bloom filter: one bit is set in each of its eight
/// 64-bit words. This keeps every query within one cache line while staying
/// near the optimal false positive rate for 5..=15 bits per distinct value.
///
/// Memory is constant after construction; there is no resize. Thread safety
/// is the caller's concern (build fully, then publish).
#[derive(Clone, Eq, PartialEq)]
pub struct BlockBloomFilter {
    /// log2 of the number of buckets
    log_num_buckets: u32,

    /// `(1 << log_num_buckets) - 1`, precomputed
    directory_mask: u32,

    directory: Box<[Bucket]>,
}

impl std::fmt::Debug for BlockBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockBloomFilter({} buckets, {}B)",
            self.directory.len(),
            self.heap_space_used(),
        )
    }
}

impl BlockBloomFilter {
    /// Creates a filter that consumes at most `1 << log_heap_space` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `log_heap_space` is not in `6..=32`.
    #[must_use]
    pub fn new(log_heap_space: u32) -> Self {
        assert!(
            log_heap_space >= LOG_BUCKET_BYTE_SIZE,
            "filter must hold at least one bucket",
        );

        let log_num_buckets = 1.max(log_heap_space - LOG_BUCKET_WORD_BITS);

        // Bucket indices are derived from 32-bit hashes
        assert!(log_num_buckets <= 32, "bloom filter too large");

        let directory_mask = ((1u64 << log_num_buckets) - 1) as u32;
        let directory = vec![[0u64; BUCKET_WORDS]; 1 << log_num_buckets].into_boxed_slice();

        Self {
            log_num_buckets,
            directory_mask,
            directory,
        }
    }

    /// Bytes of heap memory used by the directory.
    #[must_use]
    pub fn heap_space_used(&self) -> usize {
        self.directory.len() * std::mem::size_of::<Bucket>()
    }

    /// Bytes of heap memory a filter of the given size class would use.
    #[must_use]
    pub fn expected_heap_space(log_heap_space: u32) -> usize {
        assert!(log_heap_space >= LOG_BUCKET_WORD_BITS);
        std::mem::size_of::<Bucket>() * (1usize << (log_heap_space - LOG_BUCKET_WORD_BITS))
    }

    /// Adds a hash to the filter.
    ///
    /// The hash function used to produce `hash` does not need good
    /// uniformity (the identity works for 32-bit keys), only low collision
    /// probability.
    pub fn insert(&mut self, hash: u32) {
        let bucket_idx = (rehash32to32(hash) & self.directory_mask) as usize;
        let mut bits_to_set = rehash32to64(hash);

        let bucket = self
            .directory
            .get_mut(bucket_idx)
            .expect("bucket index is masked");

        for word in bucket {
            *word |= 1u64 << (bits_to_set & BUCKET_WORD_MASK);
            bits_to_set >>= LOG_BUCKET_WORD_BITS;
        }
    }

    /// Returns `true` if the hash may have been inserted.
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn find(&self, hash: u32) -> bool {
        let bucket_idx = (rehash32to32(hash) & self.directory_mask) as usize;
        let mut bits_to_set = rehash32to64(hash);

        let bucket = self.directory.get(bucket_idx).expect("bucket index is masked");

        for word in bucket {
            if *word & (1u64 << (bits_to_set & BUCKET_WORD_MASK)) == 0 {
                return false;
            }
            bits_to_set >>= LOG_BUCKET_WORD_BITS;
        }

        true
    }

    /// Computes the logical OR of `other` into `self`.
    ///
    /// # Panics
    ///
    /// Panics if the filters have different sizes.
    pub fn union_with(&mut self, other: &Self) {
        assert_eq!(
            self.log_num_buckets, other.log_num_buckets,
            "can only union equally sized filters",
        );

        for (bucket, other_bucket) in self.directory.iter_mut().zip(other.directory.iter()) {
            for (word, other_word) in bucket.iter_mut().zip(other_bucket.iter()) {
                *word |= other_word;
            }
        }
    }

    // The sizing formulas below derive from
    //
    //   fpp = (1 - exp(-BUCKET_WORDS * ndv / space))^BUCKET_WORDS
    //
    // with space in bits.

    /// Number of distinct values at which a filter of `1 << log_heap_space`
    /// bytes reaches false positive probability `fpp`.
    #[must_use]
    pub fn max_ndv(log_heap_space: u32, fpp: f64) -> usize {
        assert!(log_heap_space < 61);
        assert!(fpp > 0.0 && fpp < 1.0);

        let ik = 1.0 / BUCKET_WORDS as f64;
        let bits = (1u64 << (log_heap_space + 3)) as f64;
        (-ik * bits * (1.0 - fpp.powf(ik)).ln()) as usize
    }

    /// log2 of the minimum number of bytes needed to hold `ndv` distinct
    /// values at false positive probability `fpp`.
    #[must_use]
    pub fn min_log_space(ndv: usize, fpp: f64) -> u32 {
        if ndv == 0 {
            return 0;
        }

        let k = BUCKET_WORDS as f64;
        // Bits needed to reach the requested fpp
        let m = -k * ndv as f64 / (1.0 - fpp.powf(1.0 / k)).ln();
        (m / 8.0).log2().ceil() as u32
    }

    /// Expected false positive probability for `ndv` distinct values in
    /// `1 << log_heap_space` bytes.
    #[must_use]
    pub fn false_positive_prob(ndv: usize, log_heap_space: u32) -> f64 {
        let k = BUCKET_WORDS as f64;
        let bits = (1u64 << (log_heap_space + 3)) as f64;
        (1.0 - (-k * ndv as f64 / bits).exp()).powf(k)
    }

    /// Serializes `filter` for the wire; an absent filter becomes the
    /// always-true sentinel.
    #[must_use]
    pub fn to_wire(filter: Option<&Self>) -> WireBloomFilter {
        match filter {
            None => WireBloomFilter {
                log_heap_space: 0,
                directory: vec![],
                always_true: true,
            },
            Some(filter) => {
                let mut directory =
                    Vec::with_capacity(filter.directory.len() * std::mem::size_of::<Bucket>());

                for bucket in &filter.directory {
                    for word in bucket {
                        directory.extend_from_slice(&word.to_le_bytes());
                    }
                }

                WireBloomFilter {
                    log_heap_space: filter.log_num_buckets + LOG_BUCKET_BYTE_SIZE,
                    directory,
                    always_true: false,
                }
            }
        }
    }

    /// Reconstructs a filter from its wire form.
    ///
    /// Returns `None` for the always-true sentinel.
    pub fn from_wire(wire: &WireBloomFilter) -> crate::Result<Option<Self>> {
        if wire.always_true {
            return Ok(None);
        }

        if !(LOG_BUCKET_BYTE_SIZE..=38).contains(&wire.log_heap_space) {
            return Err(crate::Error::Corrupt(format!(
                "invalid bloom filter size class: {}",
                wire.log_heap_space,
            )));
        }

        let mut filter = Self::new(wire.log_heap_space);

        if wire.directory.len() != filter.heap_space_used() {
            return Err(crate::Error::Corrupt(format!(
                "bloom filter directory has {} bytes, expected {}",
                wire.directory.len(),
                filter.heap_space_used(),
            )));
        }

        let mut reader = &wire.directory[..];
        for bucket in filter.directory.iter_mut() {
            for word in bucket.iter_mut() {
                *word = reader.read_u64::<LittleEndian>()?;
            }
        }

        Ok(Some(filter))
    }
}

/// Hash of a slot value as fed into the filter.
///
/// The join build and the scan probe must agree on this function; NULLs
/// and collections never reach a filter.
#[must_use]
pub fn value_hash(value: &crate::row::Value) -> u32 {
    use crate::row::Value;
    use xxhash_rust::xxh3::xxh3_64;

    let hash = match value {
        Value::Boolean(v) => xxh3_64(&[u8::from(*v)]),
        Value::TinyInt(v) => xxh3_64(&v.to_le_bytes()),
        Value::SmallInt(v) => xxh3_64(&v.to_le_bytes()),
        Value::Int(v) => xxh3_64(&v.to_le_bytes()),
        Value::BigInt(v) => xxh3_64(&v.to_le_bytes()),
        Value::Float(v) => xxh3_64(&v.to_le_bytes()),
        Value::Double(v) => xxh3_64(&v.to_le_bytes()),
        Value::Decimal(v) => xxh3_64(&v.to_le_bytes()),
        Value::String(s) => xxh3_64(s),
        Value::Timestamp(ts) => {
            let mut bytes = [0u8; 12];
            bytes
                .get_mut(..8)
                .expect("12 >= 8")
                .copy_from_slice(&ts.nanos_of_day.to_le_bytes());
            bytes
                .get_mut(8..)
                .expect("12 >= 8")
                .copy_from_slice(&ts.julian_day.to_le_bytes());
            xxh3_64(&bytes)
        }
        Value::Null | Value::Collection(_) => 0,
    };

    hash as u32
}

/// Wire representation of a Bloom filter as exchanged between the join
/// build and the scan probe sides
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireBloomFilter {
    pub log_heap_space: u32,
    pub directory: Vec<u8>,
    pub always_true: bool,
}

impl Encode for WireBloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(u8::from(self.always_true))?;
        writer.write_u32::<LittleEndian>(self.log_heap_space)?;
        writer.write_u64::<LittleEndian>(self.directory.len() as u64)?;
        writer.write_all(&self.directory)?;
        Ok(())
    }
}

impl Decode for WireBloomFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let always_true = reader.read_u8()? != 0;
        let log_heap_space = reader.read_u32::<LittleEndian>()?;
        let len = reader.read_u64::<LittleEndian>()? as usize;

        let mut directory = vec![0u8; len];
        reader.read_exact(&mut directory)?;

        Ok(Self {
            log_heap_space,
            directory,
            always_true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn filter_insert_find() {
        let mut filter = BlockBloomFilter::new(10);

        for hash in 0..1_000u32 {
            filter.insert(hash.wrapping_mul(0x9e37_79b9));
            assert!(filter.find(hash.wrapping_mul(0x9e37_79b9)));
        }
    }

    #[test]
    fn filter_union() {
        let mut a = BlockBloomFilter::new(12);
        let mut b = BlockBloomFilter::new(12);

        for hash in 0..500u32 {
            a.insert(hash);
        }
        for hash in 500..1_000u32 {
            b.insert(hash);
        }

        let a_before = a.clone();
        a.union_with(&b);

        for hash in 0..2_000u32 {
            assert_eq!(
                a_before.find(hash) || b.find(hash),
                a.find(hash),
                "union must behave as the disjunction of its inputs",
            );
        }
    }

    #[test]
    #[should_panic(expected = "equally sized")]
    fn filter_union_size_mismatch() {
        let mut a = BlockBloomFilter::new(10);
        let b = BlockBloomFilter::new(11);
        a.union_with(&b);
    }

    #[test]
    fn filter_wire_round_trip() -> crate::Result<()> {
        let mut filter = BlockBloomFilter::new(8);
        for hash in 0..100u32 {
            filter.insert(hash);
        }

        let wire = BlockBloomFilter::to_wire(Some(&filter));
        assert!(!wire.always_true);

        let bytes = wire.encode_into_vec();
        let decoded = WireBloomFilter::decode_from(&mut &bytes[..])?;
        assert_eq!(wire, decoded);

        let restored = BlockBloomFilter::from_wire(&decoded)?.expect("not always-true");
        assert_eq!(filter, restored);

        for hash in 0..100u32 {
            assert!(restored.find(hash));
        }

        Ok(())
    }

    #[test]
    fn filter_absent_is_always_true() -> crate::Result<()> {
        let wire = BlockBloomFilter::to_wire(None);
        assert!(wire.always_true);
        assert!(BlockBloomFilter::from_wire(&wire)?.is_none());
        Ok(())
    }

    #[test]
    fn filter_sizing_formulas_agree() {
        for log_space in [10, 15, 20] {
            for fpp in [0.1, 0.01] {
                let ndv = BlockBloomFilter::max_ndv(log_space, fpp);
                let actual = BlockBloomFilter::false_positive_prob(ndv, log_space);
                assert!((actual - fpp).abs() / fpp < 0.05);

                assert!(BlockBloomFilter::min_log_space(ndv, fpp) <= log_space);
            }
        }
    }

    #[test]
    fn filter_min_log_space_of_zero_ndv() {
        assert_eq!(0, BlockBloomFilter::min_log_space(0, 0.01));
    }
}
