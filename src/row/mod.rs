// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Row, tuple and slot model shared by the tuple stream and the scanners

mod batch;
mod types;
mod value;

pub use batch::{RowBatch, DEFAULT_BATCH_SIZE};
pub use types::{
    ColumnDescriptor, ColumnType, RowDescriptor, SchemaPath, SlotDescriptor, TableDescriptor,
    TupleDescriptor,
};
pub use value::{
    eval_conjuncts, CollectionValue, ExprCtx, Row, TimestampValue, Tuple, Value,
};
