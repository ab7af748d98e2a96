// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Logical column type of a slot or table column
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ColumnType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,

    /// Timestamp as Julian day + nanoseconds within the day
    Timestamp,

    /// Variable-length string
    String,

    /// Variable-length string with a declared maximum length
    Varchar(usize),

    /// Fixed-length string, space padded
    Char(usize),

    /// Fixed-point decimal
    Decimal {
        precision: u8,
        scale: u8,
    },

    /// Array of a single element type
    Array(Box<ColumnType>),

    /// Map, encoded as an array of (key, value) pairs
    Map(Box<ColumnType>, Box<ColumnType>),

    /// Struct; only appears in table schemas, its fields are
    /// materialized as separate slots
    Struct(Vec<ColumnType>),
}

impl ColumnType {
    /// Byte width of a decimal with the given precision.
    #[must_use]
    pub fn decimal_byte_size(precision: u8) -> usize {
        match precision {
            0..=9 => 4,
            10..=18 => 8,
            _ => 16,
        }
    }

    #[must_use]
    pub fn is_var_len_string(&self) -> bool {
        matches!(self, Self::String | Self::Varchar(_))
    }

    #[must_use]
    pub fn is_string(&self) -> bool {
        matches!(self, Self::String | Self::Varchar(_) | Self::Char(_))
    }

    #[must_use]
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Array(_) | Self::Map(_, _))
    }

    #[must_use]
    pub fn is_var_len(&self) -> bool {
        self.is_var_len_string() || self.is_collection()
    }

    /// Bytes this type occupies in a tuple's fixed body.
    ///
    /// Var-len strings store their length word, collections their item
    /// count; the payloads are inlined behind the fixed body.
    #[must_use]
    pub fn fixed_size(&self) -> usize {
        match self {
            Self::Boolean | Self::TinyInt => 1,
            Self::SmallInt => 2,
            Self::Int | Self::Float => 4,
            Self::BigInt | Self::Double => 8,
            Self::Timestamp => 12,
            Self::String | Self::Varchar(_) => 4,
            Self::Char(len) => *len,
            Self::Decimal { precision, .. } => Self::decimal_byte_size(*precision),
            Self::Array(_) | Self::Map(_, _) => 4,
            Self::Struct(_) => unreachable!("structs are not materialized as slots"),
        }
    }
}

/// A named top-level table column
#[derive(Clone, Debug)]
pub struct ColumnDescriptor {
    pub name: String,
    pub col_type: ColumnType,
}

/// Table schema as seen by the scan: partition keys first, then data
/// columns in file order
#[derive(Clone, Debug)]
pub struct TableDescriptor {
    pub columns: Vec<ColumnDescriptor>,
    pub num_partition_keys: usize,
}

impl TableDescriptor {
    #[must_use]
    pub fn new(columns: Vec<ColumnDescriptor>, num_partition_keys: usize) -> Self {
        Self {
            columns,
            num_partition_keys,
        }
    }
}

/// Path from the table root to a (possibly nested) field, by ordinal.
///
/// The first index is table-level (it counts partition keys); each further
/// index selects a child of the previous node. Inside an array, index 0 is
/// the item and index 1 the synthetic position field; inside a map, index 0
/// is the key and index 1 the value.
pub type SchemaPath = Vec<usize>;

/// One materialized output slot of a tuple
#[derive(Clone, Debug)]
pub struct SlotDescriptor {
    pub col_type: ColumnType,

    /// Path of the source field in the table schema
    pub col_path: SchemaPath,

    /// Item layout for collection slots
    pub item_desc: Option<Box<TupleDescriptor>>,
}

impl SlotDescriptor {
    #[must_use]
    pub fn new(col_type: ColumnType, col_path: SchemaPath) -> Self {
        Self {
            col_type,
            col_path,
            item_desc: None,
        }
    }

    #[must_use]
    pub fn with_item_desc(mut self, item_desc: TupleDescriptor) -> Self {
        debug_assert!(self.col_type.is_collection());
        self.item_desc = Some(Box::new(item_desc));
        self
    }
}

/// Layout of one tuple: its slots plus whether the tuple itself may be
/// NULL within a row (e.g. the build side of an outer join)
#[derive(Clone, Debug)]
pub struct TupleDescriptor {
    pub slots: Vec<SlotDescriptor>,
    pub nullable: bool,
}

impl TupleDescriptor {
    #[must_use]
    pub fn new(slots: Vec<SlotDescriptor>) -> Self {
        Self {
            slots,
            nullable: false,
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Bytes of the serialized fixed body: slot null-indicator bytes
    /// followed by every slot's fixed part.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.null_indicator_bytes() + self.slots.iter().map(|s| s.col_type.fixed_size()).sum::<usize>()
    }

    /// One null bit per slot, rounded up to whole bytes.
    #[must_use]
    pub fn null_indicator_bytes(&self) -> usize {
        self.slots.len().div_ceil(8)
    }

    #[must_use]
    pub fn has_var_len_slots(&self) -> bool {
        self.slots.iter().any(|s| s.col_type.is_var_len())
    }

    /// Indices of var-len string slots, in slot order.
    #[must_use]
    pub fn string_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.col_type.is_var_len_string())
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of collection slots, in slot order.
    #[must_use]
    pub fn collection_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.col_type.is_collection())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Layout of a full row: the tuples produced by each plan node feeding it
#[derive(Clone, Debug)]
pub struct RowDescriptor {
    pub tuples: Vec<TupleDescriptor>,
}

impl RowDescriptor {
    #[must_use]
    pub fn new(tuples: Vec<TupleDescriptor>) -> Self {
        Self { tuples }
    }

    #[must_use]
    pub fn tuples_per_row(&self) -> usize {
        self.tuples.len()
    }

    /// Sum of the tuples' fixed body sizes.
    #[must_use]
    pub fn fixed_row_size(&self) -> usize {
        self.tuples.iter().map(TupleDescriptor::byte_size).sum()
    }

    #[must_use]
    pub fn is_any_tuple_nullable(&self) -> bool {
        self.tuples.iter().any(|t| t.nullable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn types_fixed_sizes() {
        assert_eq!(1, ColumnType::Boolean.fixed_size());
        assert_eq!(4, ColumnType::Int.fixed_size());
        assert_eq!(8, ColumnType::BigInt.fixed_size());
        assert_eq!(12, ColumnType::Timestamp.fixed_size());
        assert_eq!(4, ColumnType::String.fixed_size());
        assert_eq!(10, ColumnType::Char(10).fixed_size());
        assert_eq!(
            4,
            ColumnType::Decimal {
                precision: 9,
                scale: 2
            }
            .fixed_size()
        );
        assert_eq!(
            16,
            ColumnType::Decimal {
                precision: 38,
                scale: 0
            }
            .fixed_size()
        );
        assert_eq!(4, ColumnType::Array(Box::new(ColumnType::Int)).fixed_size());
    }

    #[test]
    fn types_tuple_byte_size() {
        let desc = TupleDescriptor::new(vec![
            SlotDescriptor::new(ColumnType::Int, vec![0]),
            SlotDescriptor::new(ColumnType::String, vec![1]),
        ]);

        // 1 null byte + 4 (int) + 4 (string length word)
        assert_eq!(9, desc.byte_size());
        assert!(desc.has_var_len_slots());
        assert_eq!(vec![1], desc.string_slots());
        assert!(desc.collection_slots().is_empty());
    }
}
