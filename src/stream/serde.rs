// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-block row encoding.
//!
//! A tuple's fixed body is its slot null-indicator bytes followed by every
//! slot's fixed part (scalars inline, strings as a length word, collections
//! as an item count). Var-len payloads follow the row's fixed bodies:
//! string payloads per tuple in slot order, then collection payloads per
//! tuple, with collection items laid out as all fixed bodies first and each
//! item's own var-len data after, in traversal order.

use crate::row::{
    CollectionValue, ColumnType, Row, RowDescriptor, Tuple, TupleDescriptor, Value,
};

fn truncated() -> crate::Error {
    crate::Error::Corrupt("truncated row data in block".into())
}

/// Serialized size of `row`: fixed bodies of non-null tuples plus every
/// inlined var-len payload.
pub(super) fn row_serialized_size(desc: &RowDescriptor, row: &Row) -> usize {
    let mut size = 0;

    for (tuple_desc, tuple) in desc.tuples.iter().zip(&row.tuples) {
        let Some(tuple) = tuple else { continue };
        size += tuple_desc.byte_size();
        size += tuple_varlen_size(tuple, tuple_desc);
    }

    size
}

fn tuple_varlen_size(tuple: &Tuple, desc: &TupleDescriptor) -> usize {
    let mut size = 0;

    for (j, slot) in desc.slots.iter().enumerate() {
        match tuple.get(j) {
            Value::String(s) if slot.col_type.is_var_len_string() => size += s.len(),
            Value::Collection(cv) if slot.col_type.is_collection() => {
                let item_desc = slot.item_desc.as_deref().expect("collection slot has item desc");
                size += cv.items.len() * item_desc.byte_size();
                for item in &cv.items {
                    size += tuple_varlen_size(item, item_desc);
                }
            }
            _ => {}
        }
    }

    size
}

/// Serializes one row into `out` (everything except the block-level null
/// indicator bits, which address per-block state).
pub(super) fn serialize_row(
    desc: &RowDescriptor,
    row: &Row,
    has_nullable: bool,
    string_slots: &[(usize, Vec<usize>)],
    coll_slots: &[(usize, Vec<usize>)],
    out: &mut Vec<u8>,
) -> crate::Result<()> {
    for (j, tuple_desc) in desc.tuples.iter().enumerate() {
        match row.tuple(j) {
            Some(tuple) => serialize_tuple_fixed(out, tuple, tuple_desc),
            None => {
                debug_assert!(
                    has_nullable && tuple_desc.nullable,
                    "NULL tuple in a non-nullable row",
                );
            }
        }
    }

    for (tuple_idx, slots) in string_slots {
        let Some(tuple) = row.tuple(*tuple_idx) else { continue };
        serialize_strings(out, tuple, slots);
    }

    for (tuple_idx, slots) in coll_slots {
        let Some(tuple) = row.tuple(*tuple_idx) else { continue };
        let tuple_desc = desc.tuples.get(*tuple_idx).expect("tuple index is valid");
        serialize_collections(out, tuple, tuple_desc, slots);
    }

    Ok(())
}

fn serialize_tuple_fixed(out: &mut Vec<u8>, tuple: &Tuple, desc: &TupleDescriptor) {
    let null_start = out.len();
    out.resize(null_start + desc.null_indicator_bytes(), 0);

    for (j, slot) in desc.slots.iter().enumerate() {
        let value = tuple.get(j);

        if value.is_null() {
            let word = out
                .get_mut(null_start + (j >> 3))
                .expect("null bytes were reserved");
            *word |= 1 << (7 - (j & 7));
        }

        serialize_value_fixed(out, value, &slot.col_type);
    }
}

fn serialize_value_fixed(out: &mut Vec<u8>, value: &Value, col_type: &ColumnType) {
    if value.is_null() {
        out.resize(out.len() + col_type.fixed_size(), 0);
        return;
    }

    match (col_type, value) {
        (ColumnType::Boolean, Value::Boolean(b)) => out.push(u8::from(*b)),
        (ColumnType::TinyInt, Value::TinyInt(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::SmallInt, Value::SmallInt(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Int, Value::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::BigInt, Value::BigInt(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Float, Value::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Double, Value::Double(v)) => out.extend_from_slice(&v.to_le_bytes()),

        (ColumnType::Timestamp, Value::Timestamp(ts)) => {
            out.extend_from_slice(&ts.nanos_of_day.to_le_bytes());
            out.extend_from_slice(&ts.julian_day.to_le_bytes());
        }

        (ColumnType::String | ColumnType::Varchar(_), Value::String(s)) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        }

        (ColumnType::Char(len), Value::String(s)) => {
            let unpadded = s.len().min(*len);
            out.extend_from_slice(s.get(..unpadded).expect("unpadded <= len"));
            out.resize(out.len() + (len - unpadded), b' ');
        }

        (ColumnType::Decimal { precision, .. }, Value::Decimal(v)) => {
            let size = ColumnType::decimal_byte_size(*precision);
            out.extend_from_slice(v.to_le_bytes().get(..size).expect("size <= 16"));
        }

        (ColumnType::Array(_) | ColumnType::Map(_, _), Value::Collection(cv)) => {
            out.extend_from_slice(&(cv.items.len() as u32).to_le_bytes());
        }

        (col_type, value) => {
            debug_assert!(false, "slot value {value:?} does not match {col_type:?}");
            out.resize(out.len() + col_type.fixed_size(), 0);
        }
    }
}

fn serialize_strings(out: &mut Vec<u8>, tuple: &Tuple, slots: &[usize]) {
    for &slot_idx in slots {
        if let Value::String(s) = tuple.get(slot_idx) {
            if !s.is_empty() {
                out.extend_from_slice(s);
            }
        }
    }
}

fn serialize_collections(
    out: &mut Vec<u8>,
    tuple: &Tuple,
    desc: &TupleDescriptor,
    slots: &[usize],
) {
    for &slot_idx in slots {
        let Value::Collection(cv) = tuple.get(slot_idx) else {
            continue;
        };
        if cv.items.is_empty() {
            continue;
        }

        let item_desc = desc
            .slots
            .get(slot_idx)
            .and_then(|s| s.item_desc.as_deref())
            .expect("collection slot has item desc");

        for item in &cv.items {
            serialize_tuple_fixed(out, item, item_desc);
        }

        if !item_desc.has_var_len_slots() {
            continue;
        }

        let item_strings = item_desc.string_slots();
        let item_colls = item_desc.collection_slots();
        for item in &cv.items {
            serialize_strings(out, item, &item_strings);
            serialize_collections(out, item, item_desc, &item_colls);
        }
    }
}

/// Fixed-body decode result: the tuple with placeholders for var-len slots,
/// plus the recorded string lengths and collection item counts by slot.
type FixedParts = (Tuple, Vec<(usize, usize)>, Vec<(usize, usize)>);

/// Decodes one row, advancing `ptr` over its bytes and `tuple_idx` by one
/// per tuple (used to address the block's null-indicator bits).
#[allow(clippy::too_many_arguments)]
pub(super) fn decode_row(
    data: &[u8],
    ptr: &mut usize,
    tuple_idx: &mut usize,
    desc: &RowDescriptor,
    has_nullable: bool,
    string_slots: &[(usize, Vec<usize>)],
    coll_slots: &[(usize, Vec<usize>)],
) -> crate::Result<Row> {
    let mut parts: Vec<Option<FixedParts>> = Vec::with_capacity(desc.tuples.len());

    for tuple_desc in &desc.tuples {
        let is_null = if has_nullable {
            let bit = *tuple_idx;
            let word = data.get(bit >> 3).ok_or_else(truncated)?;
            (word & (1 << (7 - (bit & 7)))) != 0
        } else {
            false
        };
        *tuple_idx += 1;

        if is_null {
            parts.push(None);
        } else {
            parts.push(Some(decode_tuple_fixed(data, ptr, tuple_desc)?));
        }
    }

    for (t_idx, slots) in string_slots {
        if let Some(Some((tuple, lens, _))) = parts.get_mut(*t_idx) {
            fix_up_strings(data, ptr, tuple, lens, slots)?;
        }
    }

    for (t_idx, slots) in coll_slots {
        let tuple_desc = desc.tuples.get(*t_idx).expect("tuple index is valid");
        if let Some(Some((tuple, _, counts))) = parts.get_mut(*t_idx) {
            fix_up_collections(data, ptr, tuple, tuple_desc, counts, slots)?;
        }
    }

    Ok(Row {
        tuples: parts.into_iter().map(|p| p.map(|(t, _, _)| t)).collect(),
    })
}

fn decode_tuple_fixed(
    data: &[u8],
    ptr: &mut usize,
    desc: &TupleDescriptor,
) -> crate::Result<FixedParts> {
    let null_bytes = desc.null_indicator_bytes();
    let null_start = *ptr;
    *ptr += null_bytes;
    if *ptr > data.len() {
        return Err(truncated());
    }

    let mut values = Vec::with_capacity(desc.slots.len());
    let mut string_lens = vec![];
    let mut coll_counts = vec![];

    for (j, slot) in desc.slots.iter().enumerate() {
        let word = data.get(null_start + (j >> 3)).ok_or_else(truncated)?;
        let is_null = (word & (1 << (7 - (j & 7)))) != 0;

        let size = slot.col_type.fixed_size();
        let field = data.get(*ptr..*ptr + size).ok_or_else(truncated)?;
        *ptr += size;

        if is_null {
            values.push(Value::Null);
            continue;
        }

        let value = match &slot.col_type {
            ColumnType::Boolean => Value::Boolean(field.first().copied().unwrap_or(0) != 0),
            ColumnType::TinyInt => Value::TinyInt(i8::from_le_bytes(le_array(field)?)),
            ColumnType::SmallInt => Value::SmallInt(i16::from_le_bytes(le_array(field)?)),
            ColumnType::Int => Value::Int(i32::from_le_bytes(le_array(field)?)),
            ColumnType::BigInt => Value::BigInt(i64::from_le_bytes(le_array(field)?)),
            ColumnType::Float => Value::Float(f32::from_le_bytes(le_array(field)?)),
            ColumnType::Double => Value::Double(f64::from_le_bytes(le_array(field)?)),

            ColumnType::Timestamp => {
                let nanos = field.get(..8).ok_or_else(truncated)?;
                let day = field.get(8..12).ok_or_else(truncated)?;
                Value::Timestamp(crate::row::TimestampValue {
                    nanos_of_day: i64::from_le_bytes(le_array(nanos)?),
                    julian_day: i32::from_le_bytes(le_array(day)?),
                })
            }

            ColumnType::String | ColumnType::Varchar(_) => {
                let len = u32::from_le_bytes(le_array(field)?) as usize;
                string_lens.push((j, len));
                Value::String(vec![])
            }

            ColumnType::Char(_) => Value::String(field.to_vec()),

            ColumnType::Decimal { precision, .. } => {
                Value::Decimal(decode_decimal(field, *precision))
            }

            ColumnType::Array(_) | ColumnType::Map(_, _) => {
                let count = u32::from_le_bytes(le_array(field)?) as usize;
                coll_counts.push((j, count));
                Value::Collection(CollectionValue::default())
            }

            ColumnType::Struct(_) => {
                return Err(crate::Error::Corrupt(
                    "struct slots are not materialized in streams".into(),
                ));
            }
        };

        values.push(value);
    }

    Ok((Tuple { values }, string_lens, coll_counts))
}

fn fix_up_strings(
    data: &[u8],
    ptr: &mut usize,
    tuple: &mut Tuple,
    lens: &[(usize, usize)],
    slots: &[usize],
) -> crate::Result<()> {
    for &slot_idx in slots {
        if tuple.is_null(slot_idx) {
            continue;
        }

        let len = lens
            .iter()
            .find(|(j, _)| *j == slot_idx)
            .map(|(_, len)| *len)
            .unwrap_or(0);

        if len > 0 {
            let payload = data.get(*ptr..*ptr + len).ok_or_else(truncated)?;
            tuple.set(slot_idx, Value::String(payload.to_vec()));
            *ptr += len;
        }
    }
    Ok(())
}

fn fix_up_collections(
    data: &[u8],
    ptr: &mut usize,
    tuple: &mut Tuple,
    desc: &TupleDescriptor,
    counts: &[(usize, usize)],
    slots: &[usize],
) -> crate::Result<()> {
    for &slot_idx in slots {
        if tuple.is_null(slot_idx) {
            continue;
        }

        let count = counts
            .iter()
            .find(|(j, _)| *j == slot_idx)
            .map(|(_, n)| *n)
            .unwrap_or(0);

        if count > 0 {
            let item_desc = desc
                .slots
                .get(slot_idx)
                .and_then(|s| s.item_desc.as_deref())
                .expect("collection slot has item desc");

            let cv = decode_collection(data, ptr, item_desc, count)?;
            tuple.set(slot_idx, Value::Collection(cv));
        }
    }
    Ok(())
}

fn decode_collection(
    data: &[u8],
    ptr: &mut usize,
    item_desc: &TupleDescriptor,
    count: usize,
) -> crate::Result<CollectionValue> {
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        parts.push(decode_tuple_fixed(data, ptr, item_desc)?);
    }

    if item_desc.has_var_len_slots() {
        let item_strings = item_desc.string_slots();
        let item_colls = item_desc.collection_slots();

        for (tuple, lens, counts) in &mut parts {
            fix_up_strings(data, ptr, tuple, lens, &item_strings)?;
            fix_up_collections(data, ptr, tuple, item_desc, counts, &item_colls)?;
        }
    }

    Ok(CollectionValue {
        items: parts.into_iter().map(|(t, _, _)| t).collect(),
    })
}

fn le_array<const N: usize>(field: &[u8]) -> crate::Result<[u8; N]> {
    field
        .get(..N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or_else(truncated)
}

fn decode_decimal(field: &[u8], precision: u8) -> i128 {
    let size = ColumnType::decimal_byte_size(precision);
    debug_assert_eq!(size, field.len());

    let negative = field.last().is_some_and(|b| b & 0x80 != 0);
    let mut bytes = if negative { [0xFF; 16] } else { [0; 16] };
    bytes
        .get_mut(..field.len().min(16))
        .expect("decimal fits 16 bytes")
        .copy_from_slice(field.get(..field.len().min(16)).expect("in bounds"));

    i128::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::SlotDescriptor;
    use test_log::test;

    fn nested_desc() -> RowDescriptor {
        let item = TupleDescriptor::new(vec![
            SlotDescriptor::new(ColumnType::Int, vec![]),
            SlotDescriptor::new(ColumnType::String, vec![]),
        ]);

        RowDescriptor::new(vec![TupleDescriptor::new(vec![
            SlotDescriptor::new(ColumnType::BigInt, vec![0]),
            SlotDescriptor::new(ColumnType::Array(Box::new(ColumnType::Int)), vec![1])
                .with_item_desc(item),
        ])])
    }

    #[test]
    fn row_serde_nested_round_trip() -> crate::Result<()> {
        let desc = nested_desc();

        let items = CollectionValue {
            items: vec![
                Tuple {
                    values: vec![Value::Int(1), Value::String(b"one".to_vec())],
                },
                Tuple {
                    values: vec![Value::Int(2), Value::String(vec![])],
                },
                Tuple {
                    values: vec![Value::Null, Value::String(b"three".to_vec())],
                },
            ],
        };

        let row = Row::single(Tuple {
            values: vec![Value::BigInt(7), Value::Collection(items)],
        });

        let string_slots: Vec<(usize, Vec<usize>)> = vec![];
        let coll_slots = vec![(0, vec![1])];

        let mut bytes = vec![];
        serialize_row(&desc, &row, false, &string_slots, &coll_slots, &mut bytes)?;
        assert_eq!(row_serialized_size(&desc, &row), bytes.len());

        let mut ptr = 0;
        let mut tuple_idx = 0;
        let decoded = decode_row(
            &bytes,
            &mut ptr,
            &mut tuple_idx,
            &desc,
            false,
            &string_slots,
            &coll_slots,
        )?;

        assert_eq!(row, decoded);
        assert_eq!(bytes.len(), ptr);
        assert_eq!(1, tuple_idx);

        Ok(())
    }

    #[test]
    fn row_serde_decimal_sign_extension() -> crate::Result<()> {
        let desc = RowDescriptor::new(vec![TupleDescriptor::new(vec![SlotDescriptor::new(
            ColumnType::Decimal {
                precision: 9,
                scale: 2,
            },
            vec![0],
        )])]);

        for v in [-12_345i128, 0, 99_999_999] {
            let row = Row::single(Tuple {
                values: vec![Value::Decimal(v)],
            });

            let mut bytes = vec![];
            serialize_row(&desc, &row, false, &[], &[], &mut bytes)?;

            let mut ptr = 0;
            let mut tuple_idx = 0;
            let decoded =
                decode_row(&bytes, &mut ptr, &mut tuple_idx, &desc, false, &[], &[])?;

            assert_eq!(row, decoded);
        }

        Ok(())
    }
}
