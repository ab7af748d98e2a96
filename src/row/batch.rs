// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::value::Row;

/// Default row batch capacity
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// A batch of output rows handed between operators.
///
/// Rows are added one by one and become visible to the consumer once
/// committed. `needs_return` signals that resources backing already-emitted
/// rows are about to be recycled and the batch must be passed up first.
#[derive(Debug)]
pub struct RowBatch {
    capacity: usize,
    rows: Vec<Row>,
    committed: usize,
    needs_return: bool,
}

impl RowBatch {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        Self {
            capacity,
            rows: Vec::with_capacity(capacity),
            committed: 0,
            needs_return: false,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of committed rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.committed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    /// Appends a row; it stays invisible until committed.
    pub fn add_row(&mut self, row: Row) {
        debug_assert!(!self.at_capacity());
        self.rows.push(row);
    }

    /// Commits the `n` oldest uncommitted rows.
    pub fn commit_rows(&mut self, n: usize) {
        self.committed += n;
        debug_assert!(self.committed <= self.rows.len());
        // Uncommitted leftovers above the watermark are discarded
        self.rows.truncate(self.committed);
    }

    /// Commits everything added so far.
    pub fn commit_all(&mut self) {
        self.committed = self.rows.len();
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        self.rows.get(..self.committed).unwrap_or(&self.rows)
    }

    /// Drains the committed rows, resetting the batch.
    pub fn take_rows(&mut self) -> Vec<Row> {
        self.rows.truncate(self.committed);
        self.committed = 0;
        self.needs_return = false;
        std::mem::take(&mut self.rows)
    }

    pub fn mark_need_to_return(&mut self) {
        self.needs_return = true;
    }

    #[must_use]
    pub fn needs_to_return(&self) -> bool {
        self.needs_return
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.committed = 0;
        self.needs_return = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Tuple, Value};
    use test_log::test;

    fn int_row(v: i32) -> Row {
        Row::single(Tuple {
            values: vec![Value::Int(v)],
        })
    }

    #[test]
    fn batch_commit_semantics() {
        let mut batch = RowBatch::new(4);
        assert!(batch.is_empty());

        batch.add_row(int_row(1));
        batch.add_row(int_row(2));
        assert_eq!(0, batch.num_rows());

        batch.commit_rows(2);
        assert_eq!(2, batch.num_rows());

        batch.add_row(int_row(3));
        batch.add_row(int_row(4));
        assert!(batch.at_capacity());

        // Only one of the two new rows survives
        batch.commit_rows(1);
        assert_eq!(3, batch.num_rows());

        let rows = batch.take_rows();
        assert_eq!(3, rows.len());
        assert!(batch.is_empty());
    }
}
