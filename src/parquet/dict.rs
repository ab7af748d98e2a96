// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Dictionary decoding: the dictionary page holds PLAIN values, data
//! pages hold RLE-encoded indices prefixed by one bit-width byte.

use super::{
    format::PhysicalType,
    levels::{PageData, RleDecoder},
    plain,
};
use crate::{
    row::{ColumnType, Value},
    util,
};

/// Decoder for a PLAIN_DICTIONARY column chunk
#[derive(Debug)]
pub struct DictDecoder {
    entries: Vec<Value>,
    indices: Option<RleDecoder>,
}

impl DictDecoder {
    /// Decodes the dictionary page payload into its entries.
    pub fn new(
        dict_data: &[u8],
        col_type: &ColumnType,
        physical_type: PhysicalType,
        fixed_len_size: usize,
    ) -> crate::Result<Self> {
        let mut entries = vec![];
        let mut pos = 0;

        while pos < dict_data.len() {
            entries.push(plain::decode_plain_value(
                dict_data,
                &mut pos,
                col_type,
                physical_type,
                fixed_len_size,
            )?);
        }

        Ok(Self {
            entries,
            indices: None,
        })
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Points the decoder at a data page's index section.
    pub fn set_data(&mut self, page: PageData, start: usize, len: usize) -> crate::Result<()> {
        let bit_width = page.get(start).copied().ok_or_else(|| {
            crate::Error::Corrupt("dictionary-encoded page is missing its bit width".into())
        })?;

        if u32::from(bit_width) > 32
            || u32::from(bit_width) < util::bit_width(self.entries.len() as u64)
        {
            return Err(crate::Error::Corrupt(format!(
                "invalid dictionary index bit width: {bit_width}",
            )));
        }

        self.indices = Some(RleDecoder::new(
            page,
            start + 1,
            len.saturating_sub(1),
            u32::from(bit_width),
        ));
        Ok(())
    }

    /// Returns the next value of the data page.
    pub fn get_next(&mut self) -> crate::Result<Value> {
        let idx = self
            .indices
            .as_mut()
            .and_then(RleDecoder::get)
            .ok_or_else(|| {
                crate::Error::Corrupt("dictionary index stream exhausted".into())
            })?;

        self.entries
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| {
                crate::Error::Corrupt(format!(
                    "dictionary index {idx} out of range ({} entries)",
                    self.entries.len(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parquet::levels::encode::rle_encode;
    use std::sync::Arc;
    use test_log::test;

    fn int_dict(values: &[i32]) -> Vec<u8> {
        let mut out = vec![];
        for &v in values {
            plain::encode_plain_value(&mut out, &Value::Int(v), 0);
        }
        out
    }

    #[test]
    fn dict_decode_indices() -> crate::Result<()> {
        let dict_page = int_dict(&[10, 20, 30, 40]);
        let mut decoder =
            DictDecoder::new(&dict_page, &ColumnType::Int, PhysicalType::Int32, 0)?;
        assert_eq!(4, decoder.num_entries());

        let indices = [0u64, 3, 3, 1, 2, 0];
        let mut page = vec![2u8]; // bit width
        page.extend(rle_encode(&indices, 2));
        let page = Arc::new(page);

        decoder.set_data(page.clone(), 0, page.len())?;

        for &idx in &indices {
            let expected = Value::Int((idx as i32 + 1) * 10);
            assert_eq!(expected, decoder.get_next()?);
        }

        Ok(())
    }

    #[test]
    fn dict_out_of_range_index_fails() -> crate::Result<()> {
        let dict_page = int_dict(&[1, 2]);
        let mut decoder =
            DictDecoder::new(&dict_page, &ColumnType::Int, PhysicalType::Int32, 0)?;

        let mut page = vec![3u8];
        page.extend(rle_encode(&[7], 3));
        let page = Arc::new(page);

        decoder.set_data(page.clone(), 0, page.len())?;
        assert!(matches!(
            decoder.get_next(),
            Err(crate::Error::Corrupt(_))
        ));

        Ok(())
    }
}
