// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! PLAIN-encoded value decoding per physical type.

use super::format::PhysicalType;
use crate::row::{ColumnType, TimestampValue, Value};

fn truncated() -> crate::Error {
    crate::Error::Corrupt("data page truncated while decoding a value".into())
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> crate::Result<&'a [u8]> {
    let field = data.get(*pos..*pos + len).ok_or_else(truncated)?;
    *pos += len;
    Ok(field)
}

fn le<const N: usize>(field: &[u8]) -> crate::Result<[u8; N]> {
    field
        .get(..N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or_else(truncated)
}

/// Decodes one PLAIN value at `pos`, producing the logical value for the
/// slot's column type.
///
/// `fixed_len_size` is the declared length for FIXED_LEN_BYTE_ARRAY
/// columns, otherwise unused. Booleans are not handled here; they decode
/// through the page-level bit reader.
pub fn decode_plain_value(
    data: &[u8],
    pos: &mut usize,
    col_type: &ColumnType,
    physical_type: PhysicalType,
    fixed_len_size: usize,
) -> crate::Result<Value> {
    Ok(match physical_type {
        PhysicalType::Int32 => {
            let v = i32::from_le_bytes(le(take(data, pos, 4)?)?);
            match col_type {
                ColumnType::TinyInt => Value::TinyInt(v as i8),
                ColumnType::SmallInt => Value::SmallInt(v as i16),
                _ => Value::Int(v),
            }
        }

        PhysicalType::Int64 => Value::BigInt(i64::from_le_bytes(le(take(data, pos, 8)?)?)),

        PhysicalType::Int96 => {
            let field = take(data, pos, 12)?;
            Value::Timestamp(TimestampValue {
                nanos_of_day: i64::from_le_bytes(le(field.get(..8).ok_or_else(truncated)?)?),
                julian_day: i32::from_le_bytes(le(field.get(8..12).ok_or_else(truncated)?)?),
            })
        }

        PhysicalType::Float => Value::Float(f32::from_le_bytes(le(take(data, pos, 4)?)?)),

        PhysicalType::Double => Value::Double(f64::from_le_bytes(le(take(data, pos, 8)?)?)),

        PhysicalType::ByteArray => {
            let len = u32::from_le_bytes(le(take(data, pos, 4)?)?) as usize;
            Value::String(take(data, pos, len)?.to_vec())
        }

        PhysicalType::FixedLenByteArray => {
            let field = take(data, pos, fixed_len_size)?;
            match col_type {
                ColumnType::Decimal { .. } => Value::Decimal(decode_decimal_be(field)),
                _ => Value::String(field.to_vec()),
            }
        }

        PhysicalType::Boolean => {
            return Err(crate::Error::Corrupt(
                "PLAIN booleans decode through the page bit reader".into(),
            ));
        }
    })
}

/// FIXED_LEN_BYTE_ARRAY decimals are big-endian two's complement.
fn decode_decimal_be(field: &[u8]) -> i128 {
    let negative = field.first().is_some_and(|b| b & 0x80 != 0);
    let mut value: i128 = if negative { -1 } else { 0 };
    for &byte in field {
        value = (value << 8) | i128::from(byte);
    }
    value
}

/// Byte width of one PLAIN value for sizing dictionaries; `None` for
/// variable-width (BYTE_ARRAY) columns.
#[must_use]
pub fn plain_value_width(physical_type: PhysicalType, fixed_len_size: usize) -> Option<usize> {
    match physical_type {
        PhysicalType::Int32 | PhysicalType::Float => Some(4),
        PhysicalType::Int64 | PhysicalType::Double => Some(8),
        PhysicalType::Int96 => Some(12),
        PhysicalType::FixedLenByteArray => Some(fixed_len_size),
        PhysicalType::ByteArray | PhysicalType::Boolean => None,
    }
}

/// PLAIN encoding of one value, the inverse of [`decode_plain_value`].
#[cfg(test)]
pub fn encode_plain_value(out: &mut Vec<u8>, value: &Value, fixed_len_size: usize) {
    match value {
        Value::TinyInt(v) => out.extend_from_slice(&i32::from(*v).to_le_bytes()),
        Value::SmallInt(v) => out.extend_from_slice(&i32::from(*v).to_le_bytes()),
        Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::BigInt(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),

        Value::Timestamp(ts) => {
            out.extend_from_slice(&ts.nanos_of_day.to_le_bytes());
            out.extend_from_slice(&ts.julian_day.to_le_bytes());
        }

        Value::String(s) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s);
        }

        Value::Decimal(v) => {
            let be = v.to_be_bytes();
            out.extend_from_slice(&be[16 - fixed_len_size..]);
        }

        Value::Boolean(_) | Value::Null | Value::Collection(_) => {
            unreachable!("not PLAIN-encodable: {value:?}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn plain_int32_round_trip() -> crate::Result<()> {
        let mut bytes = vec![];
        for v in [0, 1, -1, i32::MAX, i32::MIN] {
            encode_plain_value(&mut bytes, &Value::Int(v), 0);
        }

        let mut pos = 0;
        for v in [0, 1, -1, i32::MAX, i32::MIN] {
            let decoded = decode_plain_value(
                &bytes,
                &mut pos,
                &ColumnType::Int,
                PhysicalType::Int32,
                0,
            )?;
            assert_eq!(Value::Int(v), decoded);
        }
        assert_eq!(bytes.len(), pos);

        Ok(())
    }

    #[test]
    fn plain_byte_array_round_trip() -> crate::Result<()> {
        let mut bytes = vec![];
        encode_plain_value(&mut bytes, &Value::String(b"hello".to_vec()), 0);
        encode_plain_value(&mut bytes, &Value::String(vec![]), 0);

        let mut pos = 0;
        assert_eq!(
            Value::String(b"hello".to_vec()),
            decode_plain_value(
                &bytes,
                &mut pos,
                &ColumnType::String,
                PhysicalType::ByteArray,
                0
            )?,
        );
        assert_eq!(
            Value::String(vec![]),
            decode_plain_value(
                &bytes,
                &mut pos,
                &ColumnType::String,
                PhysicalType::ByteArray,
                0
            )?,
        );

        Ok(())
    }

    #[test]
    fn plain_decimal_big_endian() -> crate::Result<()> {
        let col_type = ColumnType::Decimal {
            precision: 9,
            scale: 2,
        };

        for v in [-123_456i128, 0, 1, 999_999_999] {
            let mut bytes = vec![];
            encode_plain_value(&mut bytes, &Value::Decimal(v), 4);
            assert_eq!(4, bytes.len());

            let mut pos = 0;
            let decoded = decode_plain_value(
                &bytes,
                &mut pos,
                &col_type,
                PhysicalType::FixedLenByteArray,
                4,
            )?;
            assert_eq!(Value::Decimal(v), decoded);
        }

        Ok(())
    }

    #[test]
    fn plain_truncated_fails() {
        let bytes = vec![1, 2];
        let mut pos = 0;
        assert!(matches!(
            decode_plain_value(&bytes, &mut pos, &ColumnType::Int, PhysicalType::Int32, 0),
            Err(crate::Error::Corrupt(_))
        ));
    }
}
