// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::types::TupleDescriptor;

/// Timestamp value: Julian day plus nanoseconds within the day
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TimestampValue {
    pub julian_day: i32,
    pub nanos_of_day: i64,
}

impl TimestampValue {
    #[must_use]
    pub fn has_date_and_time(&self) -> bool {
        self.julian_day != 0 || self.nanos_of_day != 0
    }

    /// Shifts the timestamp by a fixed offset, used for legacy
    /// UTC-to-local conversion.
    #[must_use]
    pub fn offset_by_seconds(mut self, seconds: i64) -> Self {
        const NANOS_PER_DAY: i64 = 86_400 * 1_000_000_000;

        let mut nanos = self.nanos_of_day + seconds * 1_000_000_000;
        while nanos < 0 {
            nanos += NANOS_PER_DAY;
            self.julian_day -= 1;
        }
        while nanos >= NANOS_PER_DAY {
            nanos -= NANOS_PER_DAY;
            self.julian_day += 1;
        }
        self.nanos_of_day = nanos;
        self
    }
}

/// A materialized collection: the item tuples in order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionValue {
    pub items: Vec<Tuple>,
}

impl CollectionValue {
    #[must_use]
    pub fn num_tuples(&self) -> usize {
        self.items.len()
    }
}

/// A single slot value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Timestamp(TimestampValue),
    String(Vec<u8>),
    Decimal(i128),
    Collection(CollectionValue),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// One materialized tuple; `values` is aligned with the descriptor's slots
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tuple {
    pub values: Vec<Value>,
}

impl Tuple {
    /// An all-NULL tuple matching `desc`.
    #[must_use]
    pub fn null_of(desc: &TupleDescriptor) -> Self {
        Self {
            values: vec![Value::Null; desc.slots.len()],
        }
    }

    #[must_use]
    pub fn is_null(&self, slot_idx: usize) -> bool {
        self.values.get(slot_idx).is_none_or(Value::is_null)
    }

    pub fn set(&mut self, slot_idx: usize, value: Value) {
        if let Some(slot) = self.values.get_mut(slot_idx) {
            *slot = value;
        }
    }

    #[must_use]
    pub fn get(&self, slot_idx: usize) -> &Value {
        self.values.get(slot_idx).unwrap_or(&Value::Null)
    }
}

/// One row: one optional tuple per entry of the row descriptor
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    pub tuples: Vec<Option<Tuple>>,
}

impl Row {
    #[must_use]
    pub fn single(tuple: Tuple) -> Self {
        Self {
            tuples: vec![Some(tuple)],
        }
    }

    #[must_use]
    pub fn tuple(&self, idx: usize) -> Option<&Tuple> {
        self.tuples.get(idx).and_then(Option::as_ref)
    }
}

/// Expression evaluation boundary, e.g. a scan conjunct.
///
/// `eval` returns the expression value for the row, or `None` for NULL.
pub trait ExprCtx: Send {
    fn prepare(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn open(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn eval(&self, row: &Row) -> Option<Value>;
}

/// Evaluates conjuncts; a row passes if every conjunct yields TRUE.
#[must_use]
pub fn eval_conjuncts(conjuncts: &[Box<dyn ExprCtx>], row: &Row) -> bool {
    conjuncts
        .iter()
        .all(|c| matches!(c.eval(row), Some(Value::Boolean(true))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn value_timestamp_offset() {
        let ts = TimestampValue {
            julian_day: 100,
            nanos_of_day: 0,
        };

        let back = ts.offset_by_seconds(-1);
        assert_eq!(99, back.julian_day);
        assert_eq!(86_399 * 1_000_000_000, back.nanos_of_day);

        let forward = back.offset_by_seconds(1);
        assert_eq!(ts, forward);
    }

    #[test]
    fn value_eval_conjuncts() {
        struct Always(bool);

        impl ExprCtx for Always {
            fn eval(&self, _: &Row) -> Option<Value> {
                Some(Value::Boolean(self.0))
            }
        }

        let row = Row::default();

        let pass: Vec<Box<dyn ExprCtx>> = vec![Box::new(Always(true)), Box::new(Always(true))];
        assert!(eval_conjuncts(&pass, &row));

        let fail: Vec<Box<dyn ExprCtx>> = vec![Box::new(Always(true)), Box::new(Always(false))];
        assert!(!eval_conjuncts(&fail, &row));

        assert!(eval_conjuncts(&[], &row));
    }
}
