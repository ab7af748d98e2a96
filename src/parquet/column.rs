// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Column readers: per-column state machines over definition/repetition
//! levels that materialize values into tuples.
//!
//! A reader reads one def/rep level pair at a time. `read_value` should
//! only be called when the current value is defined for the enclosing
//! collection, i.e. `def_level >= ira_def_level`; otherwise `next_levels`
//! skips the position (empty or NULL enclosing arrays produce no output).

use super::{
    dict::DictDecoder,
    format::{
        ColumnMetaData, Encoding, FileVersion, PageHeader, PageType, PhysicalType,
        MAX_PAGE_HEADER_SIZE,
    },
    levels::{BitReader, LevelDecoder, PageData, RleDecoder},
    plain,
    schema::SchemaNode,
};
use crate::{
    codec::Decompressor,
    coding::{Decode, DecodeError},
    filter::{value_hash, BlockBloomFilter},
    row::{CollectionValue, ColumnType, Tuple, TupleDescriptor, Value},
    util,
};
use std::sync::Arc;

/// After this many values, a filter rejecting under this fraction is not
/// paying for itself and gets dropped for the rest of the column.
const FILTER_EVAL_MIN_ROWS: i64 = 10_000;
const FILTER_MIN_REJECT_RATIO: f64 = 0.1;

/// Per-reader copy of the relevant schema node fields
#[derive(Clone, Debug)]
pub(super) struct NodeInfo {
    pub name: String,
    pub repetition: super::format::Repetition,
    pub physical_type: Option<PhysicalType>,
    pub converted_type: Option<super::format::ConvertedType>,
    pub type_length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub col_idx: Option<usize>,
    pub max_def_level: i32,
    pub max_rep_level: i32,
    pub ira_def_level: i32,
}

impl From<&SchemaNode> for NodeInfo {
    fn from(node: &SchemaNode) -> Self {
        Self {
            name: node.element.name.clone(),
            repetition: node.element.repetition,
            physical_type: node.element.physical_type,
            converted_type: node.element.converted_type,
            type_length: node.element.type_length,
            precision: node.element.precision,
            scale: node.element.scale,
            col_idx: node.col_idx,
            max_def_level: node.max_def_level,
            max_rep_level: node.max_rep_level,
            ira_def_level: node.ira_def_level,
        }
    }
}

/// Options resolved once per file and shared by all readers
#[derive(Clone, Debug, Default)]
pub(super) struct ReaderConfig {
    pub file_version: FileVersion,
    pub convert_legacy_hive_parquet_utc_timestamps: bool,
    pub local_time_offset_secs: i64,
}

/// The output slot a reader materializes into
#[derive(Clone, Debug)]
pub(super) struct SlotInfo {
    pub slot_idx: usize,
    pub col_type: ColumnType,
}

/// In-memory cursor over one column chunk's raw bytes
#[derive(Debug)]
pub(super) struct PageStream {
    data: Vec<u8>,
    pos: usize,
}

impl PageStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Up to `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> &[u8] {
        let end = (self.pos + n).min(self.data.len());
        self.data.get(self.pos..end).unwrap_or(&[])
    }

    pub fn skip(&mut self, n: usize) -> crate::Result<()> {
        if n > self.remaining() {
            return Err(crate::Error::Corrupt(
                "column chunk ended unexpectedly".into(),
            ));
        }
        self.pos += n;
        Ok(())
    }

    pub fn read(&mut self, n: usize) -> crate::Result<Vec<u8>> {
        if n > self.remaining() {
            return Err(crate::Error::Corrupt(
                "column chunk ended unexpectedly".into(),
            ));
        }
        let out = self
            .data
            .get(self.pos..self.pos + n)
            .expect("bounds were checked")
            .to_vec();
        self.pos += n;
        Ok(out)
    }
}

// In 1.1 (and 1.2.0-internal builds), the dictionary page header was not
// always set; for those writers the entry-count check is skipped.
fn requires_skipped_dict_header_check(v: &FileVersion) -> bool {
    if v.application != "impala" {
        return false;
    }
    v.eq_version(1, 1, 0) || (v.eq_version(1, 2, 0) && v.is_impala_internal)
}

/// A logical column reader: either a scalar column materialized in the
/// file, or a collection assembled from its children's levels
pub(super) enum ColumnReader {
    Scalar(ScalarReader),
    Collection(CollectionReader),
}

impl ColumnReader {
    pub fn def_level(&self) -> i32 {
        match self {
            Self::Scalar(r) => r.def_level,
            Self::Collection(r) => r.def_level,
        }
    }

    pub fn rep_level(&self) -> i32 {
        match self {
            Self::Scalar(r) => r.rep_level,
            Self::Collection(r) => r.rep_level,
        }
    }

    pub fn node(&self) -> &NodeInfo {
        match self {
            Self::Scalar(r) => &r.node,
            Self::Collection(r) => &r.node,
        }
    }

    pub fn max_rep_level(&self) -> i32 {
        self.node().max_rep_level
    }

    pub fn ira_def_level(&self) -> i32 {
        self.node().ira_def_level
    }

    pub fn pos_slot(&self) -> Option<usize> {
        match self {
            Self::Scalar(r) => r.pos_slot,
            Self::Collection(r) => r.pos_slot,
        }
    }

    pub fn set_pos_slot(&mut self, slot_idx: usize) {
        match self {
            Self::Scalar(r) => {
                debug_assert!(r.pos_slot.is_none());
                r.pos_slot = Some(slot_idx);
            }
            Self::Collection(r) => {
                debug_assert!(r.pos_slot.is_none());
                r.pos_slot = Some(slot_idx);
            }
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Collection(_))
    }

    /// Advances to the next def/rep level pair without materializing.
    pub fn next_levels(&mut self) -> crate::Result<()> {
        match self {
            Self::Scalar(r) => r.next_levels(),
            Self::Collection(r) => r.next_levels(),
        }
    }

    /// Materializes the current value (or NULL) into `tuple` and
    /// advances. `conjuncts_passed` is cleared when a filter rejects the
    /// value.
    pub fn read_value(
        &mut self,
        tuple: &mut Tuple,
        conjuncts_passed: &mut bool,
    ) -> crate::Result<()> {
        match self {
            Self::Scalar(r) => r.read_value(tuple, conjuncts_passed),
            Self::Collection(r) => r.read_value(tuple, conjuncts_passed),
        }
    }

    /// Writes the enclosing collection's running position into the
    /// position slot.
    pub fn read_position(&mut self, tuple: &mut Tuple) {
        let (pos_slot, pos_value) = match self {
            Self::Scalar(r) => (r.pos_slot, &mut r.pos_current_value),
            Self::Collection(r) => (r.pos_slot, &mut r.pos_current_value),
        };

        let slot_idx = pos_slot.expect("reader carries the position slot");
        debug_assert!(*pos_value >= 0);

        tuple.set(slot_idx, Value::BigInt(*pos_value));
        *pos_value += 1;
    }
}

/// Runs `f` over every scalar reader of the tree, depth first.
pub(super) fn visit_scalars_mut<F>(
    readers: &mut [ColumnReader],
    f: &mut F,
) -> crate::Result<()>
where
    F: FnMut(&mut ScalarReader) -> crate::Result<()>,
{
    for reader in readers {
        match reader {
            ColumnReader::Scalar(scalar) => f(scalar)?,
            ColumnReader::Collection(collection) => {
                visit_scalars_mut(&mut collection.children, f)?;
            }
        }
    }
    Ok(())
}

/// Reads one row worth of values from `readers` into `tuple`.
pub(super) fn read_row(
    readers: &mut [ColumnReader],
    tuple: &mut Tuple,
    materialize_tuple: bool,
    in_collection: bool,
    conjuncts_passed: &mut bool,
) -> crate::Result<()> {
    debug_assert!(!readers.is_empty());

    for reader in readers.iter_mut() {
        if !in_collection {
            debug_assert!(materialize_tuple);
            debug_assert!(reader.pos_slot().is_none());
            reader.read_value(tuple, conjuncts_passed)?;
        } else if materialize_tuple {
            debug_assert!(reader.def_level() >= reader.ira_def_level());
            if reader.pos_slot().is_some() {
                reader.read_position(tuple);
            }
            reader.read_value(tuple, conjuncts_passed)?;
        } else {
            // A containing repeated field is empty or NULL
            debug_assert!(reader.def_level() < reader.ira_def_level());
            reader.next_levels()?;
        }
    }

    Ok(())
}

/// Assembles one collection value by draining `readers` until they report
/// the start of the next collection.
pub(super) fn assemble_collection(
    item_desc: &TupleDescriptor,
    readers: &mut [ColumnReader],
    new_collection_rep_level: i32,
) -> crate::Result<CollectionValue> {
    debug_assert!(!readers.is_empty());
    debug_assert!(new_collection_rep_level >= 0);

    let mut items = vec![];

    loop {
        let first = readers.first().expect("readers is non-empty");
        let materialize_item = first.def_level() >= first.ira_def_level();

        let mut tuple = Tuple::null_of(item_desc);
        let mut conjuncts_passed = true;
        read_row(readers, &mut tuple, materialize_item, true, &mut conjuncts_passed)?;

        if materialize_item {
            items.push(tuple);
        }

        let first = readers.first().expect("readers is non-empty");
        if first.rep_level() <= new_collection_rep_level {
            break;
        }
    }

    Ok(CollectionValue { items })
}

/// Reader for one scalar column chunk, including the counting flavor
/// (`slot == None`) that only drives levels.
pub(super) struct ScalarReader {
    pub(super) node: NodeInfo,
    config: ReaderConfig,

    pub(super) slot: Option<SlotInfo>,
    pos_slot: Option<usize>,
    pos_current_value: i64,

    rep_level: i32,
    def_level: i32,

    pub(super) metadata: Option<ColumnMetaData>,
    stream: Option<PageStream>,
    decompressor: Option<Decompressor>,
    page_header: Option<PageHeader>,

    pub(super) num_buffered_values: i64,
    pub(super) num_values_read: i64,

    page_data: Option<PageData>,
    data_pos: usize,

    def_decoder: Option<LevelDecoder>,
    rep_decoder: Option<LevelDecoder>,

    dict: Option<DictDecoder>,
    bool_reader: Option<BitReader>,

    /// Declared length for FIXED_LEN_BYTE_ARRAY (decimal width for
    /// decimals); unused otherwise
    fixed_len_size: usize,

    needs_conversion: bool,

    filter: Option<Arc<BlockBloomFilter>>,
    rows_returned: i64,
    filter_rows_rejected: i64,
}

impl ScalarReader {
    pub fn new(
        node: NodeInfo,
        slot: Option<SlotInfo>,
        config: ReaderConfig,
        filter: Option<Arc<BlockBloomFilter>>,
    ) -> Self {
        debug_assert!(node.col_idx.is_some());

        let fixed_len_size = slot
            .as_ref()
            .map(|slot| match &slot.col_type {
                ColumnType::Decimal { precision, .. } => {
                    ColumnType::decimal_byte_size(*precision)
                }
                ColumnType::Varchar(len) => *len,
                _ => node.type_length.unwrap_or(0) as usize,
            })
            .unwrap_or(0);

        let needs_conversion = slot.as_ref().is_some_and(|slot| {
            matches!(slot.col_type, ColumnType::Char(_))
                || (config.convert_legacy_hive_parquet_utc_timestamps
                    && matches!(slot.col_type, ColumnType::Timestamp)
                    && config.file_version.application == "parquet-mr")
        });

        Self {
            node,
            config,
            slot,
            pos_slot: None,
            pos_current_value: -1,
            rep_level: -1,
            def_level: -1,
            metadata: None,
            stream: None,
            decompressor: None,
            page_header: None,
            num_buffered_values: 0,
            num_values_read: 0,
            page_data: None,
            data_pos: 0,
            def_decoder: None,
            rep_decoder: None,
            dict: None,
            bool_reader: None,
            fixed_len_size,
            needs_conversion,
            filter,
            rows_returned: 0,
            filter_rows_rejected: 0,
        }
    }

    pub fn col_idx(&self) -> usize {
        self.node.col_idx.expect("scalar readers sit on leaves")
    }

    /// Called once per row group with the column chunk's metadata and its
    /// raw bytes.
    pub fn reset(&mut self, metadata: &ColumnMetaData, stream: PageStream) -> crate::Result<()> {
        self.num_buffered_values = 0;
        self.num_values_read = 0;
        self.stream = Some(stream);
        self.metadata = Some(metadata.clone());
        self.page_header = None;
        self.page_data = None;
        self.data_pos = 0;
        self.def_decoder = None;
        self.rep_decoder = None;
        self.dict = None;
        self.bool_reader = None;
        self.def_level = -1;
        self.rep_level = -1;
        self.pos_current_value = -1;

        self.decompressor = Decompressor::create(metadata.codec)?;
        Ok(())
    }

    /// Final cleanup once the scan is done with the reader.
    pub fn close(&mut self) {
        self.decompressor = None;
        self.stream = None;
        self.page_data = None;
    }

    fn metadata(&self) -> &ColumnMetaData {
        self.metadata.as_ref().expect("reset() ran for this row group")
    }

    /// Reads the next data page, consuming (at most one) dictionary page
    /// and skipping page types it does not know.
    fn read_data_page(&mut self) -> crate::Result<()> {
        loop {
            debug_assert_eq!(0, self.num_buffered_values);

            let total_values = self.metadata().num_values;
            if self.num_values_read == total_values {
                // No more pages to read
                break;
            }
            if self.num_values_read > total_values {
                return Err(crate::Error::Corrupt(format!(
                    "column '{}' has more values than declared in its metadata ({} > {})",
                    self.node.name, self.num_values_read, total_values,
                )));
            }

            if self.stream.as_ref().is_none_or(|s| s.remaining() == 0) {
                // Fewer values than the metadata declared
                return Err(crate::Error::Corrupt(format!(
                    "column '{}' has fewer values than declared in its metadata ({} < {})",
                    self.node.name, self.num_values_read, total_values,
                )));
            }

            let (header, header_size) = self.parse_page_header()?;
            self.stream
                .as_mut()
                .expect("stream is set")
                .skip(header_size)?;

            let data_size = header.compressed_page_size.max(0) as usize;
            let uncompressed_size = header.uncompressed_page_size.max(0) as usize;

            if header.page_type == PageType::Dictionary {
                if self.slot.is_none() {
                    // Counting readers never decode values, and without a
                    // slot there may not even be the right reader type to
                    // interpret the dictionary
                    self.stream.as_mut().expect("stream is set").skip(data_size)?;
                    continue;
                }

                self.read_dictionary_page(&header, data_size, uncompressed_size)?;
                continue;
            }

            if header.page_type != PageType::Data {
                // Unknown page types are skippable
                self.stream.as_mut().expect("stream is set").skip(data_size)?;
                continue;
            }

            let data_page_header = header.data_page_header.clone().ok_or_else(|| {
                crate::Error::Corrupt(format!(
                    "data page of column '{}' is missing its header",
                    self.node.name,
                ))
            })?;

            let raw = self.stream.as_mut().expect("stream is set").read(data_size)?;

            self.num_buffered_values = i64::from(data_page_header.num_values);
            self.num_values_read += self.num_buffered_values;

            let page_data: PageData = match &self.decompressor {
                Some(decompressor) => {
                    let decompressed = decompressor.process_block(&raw, uncompressed_size)?;
                    log::trace!(
                        "decompressed {} to {} bytes for column '{}'",
                        raw.len(),
                        uncompressed_size,
                        self.node.name,
                    );
                    Arc::new(decompressed)
                }
                None => {
                    if raw.len() != uncompressed_size {
                        return Err(crate::Error::Corrupt(format!(
                            "uncompressed page size mismatch in column '{}'",
                            self.node.name,
                        )));
                    }
                    Arc::new(raw)
                }
            };

            self.data_pos = 0;

            if self.node.max_rep_level > 0 {
                self.rep_decoder = Some(init_level_decoder(
                    data_page_header.repetition_level_encoding,
                    self.node.max_rep_level,
                    &page_data,
                    &mut self.data_pos,
                    self.num_buffered_values,
                )?);
            }

            if self.node.max_def_level > 0 {
                self.def_decoder = Some(init_level_decoder(
                    data_page_header.definition_level_encoding,
                    self.node.max_def_level,
                    &page_data,
                    &mut self.data_pos,
                    self.num_buffered_values,
                )?);
            }

            // The value section can be empty if every value is NULL
            if self.data_pos < page_data.len() {
                self.init_data_section(data_page_header.encoding, &page_data)?;
            }

            self.page_header = Some(header);
            self.page_data = Some(page_data);
            break;
        }

        Ok(())
    }

    /// Decodes the page header, widening the peek window until it fits or
    /// exceeds the hard cap.
    fn parse_page_header(&mut self) -> crate::Result<(PageHeader, usize)> {
        let stream = self.stream.as_ref().expect("stream is set");

        let mut window_len = 1024.min(stream.remaining());

        loop {
            let window = stream.peek(window_len);
            let mut cursor = std::io::Cursor::new(window);

            match PageHeader::decode_from(&mut cursor) {
                Ok(header) => return Ok((header, cursor.position() as usize)),

                Err(DecodeError::Io(_)) => {
                    if window_len >= MAX_PAGE_HEADER_SIZE {
                        return Err(crate::Error::Corrupt(format!(
                            "page header of column '{}' exceeded maximum size of {MAX_PAGE_HEADER_SIZE} bytes",
                            self.node.name,
                        )));
                    }
                    if window_len >= stream.remaining() {
                        return Err(crate::Error::Corrupt(format!(
                            "reached end of column '{}' while reading a page header",
                            self.node.name,
                        )));
                    }
                    window_len = (window_len * 2).max(1024).min(stream.remaining());
                }

                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_dictionary_page(
        &mut self,
        header: &PageHeader,
        data_size: usize,
        uncompressed_size: usize,
    ) -> crate::Result<()> {
        if self.dict.is_some() {
            return Err(crate::Error::Corrupt(
                "column chunk should not contain two dictionary pages".into(),
            ));
        }
        if self.node.physical_type == Some(PhysicalType::Boolean) {
            return Err(crate::Error::Corrupt(
                "unexpected dictionary page: dictionaries are not supported for booleans".into(),
            ));
        }

        let dict_header = match &header.dictionary_page_header {
            Some(dict_header) => Some(dict_header),
            None => {
                if !requires_skipped_dict_header_check(&self.config.file_version) {
                    return Err(crate::Error::Corrupt(
                        "dictionary page does not have its dictionary header set".into(),
                    ));
                }
                log::debug!(
                    "accepting dictionary page without header from writer {:?}",
                    self.config.file_version.application,
                );
                None
            }
        };

        if let Some(dict_header) = dict_header {
            if !matches!(
                dict_header.encoding,
                Encoding::Plain | Encoding::PlainDictionary
            ) {
                return Err(crate::Error::Corrupt(
                    "only PLAIN and PLAIN_DICTIONARY encodings are supported for dictionary pages"
                        .into(),
                ));
            }
        }

        let raw = self.stream.as_mut().expect("stream is set").read(data_size)?;

        let dict_values = match &self.decompressor {
            Some(decompressor) => decompressor.process_block(&raw, uncompressed_size)?,
            None => {
                if raw.len() != uncompressed_size {
                    return Err(crate::Error::Corrupt(format!(
                        "uncompressed dictionary page size mismatch in column '{}'",
                        self.node.name,
                    )));
                }
                raw
            }
        };

        let slot = self.slot.as_ref().expect("dictionary pages need a slot");
        let physical_type = self
            .node
            .physical_type
            .expect("leaf nodes have a physical type");

        let dict = DictDecoder::new(
            &dict_values,
            &slot.col_type,
            physical_type,
            self.fixed_len_size,
        )?;

        if let Some(dict_header) = dict_header {
            if dict_header.num_values as usize != dict.num_entries() {
                return Err(crate::Error::Corrupt(format!(
                    "invalid dictionary: expected {} entries but data contained {} entries",
                    dict_header.num_values,
                    dict.num_entries(),
                )));
            }
        }

        self.dict = Some(dict);
        Ok(())
    }

    fn init_data_section(
        &mut self,
        encoding: Encoding,
        page_data: &PageData,
    ) -> crate::Result<()> {
        match encoding {
            Encoding::PlainDictionary => {
                if self.slot.is_some() {
                    let dict = self.dict.as_mut().ok_or_else(|| {
                        crate::Error::Corrupt("file corrupt: missing dictionary page".into())
                    })?;
                    dict.set_data(
                        page_data.clone(),
                        self.data_pos,
                        page_data.len() - self.data_pos,
                    )?;
                }
            }

            Encoding::Plain => {
                if self.node.physical_type == Some(PhysicalType::Boolean) {
                    self.bool_reader = Some(BitReader::new(
                        page_data.clone(),
                        self.data_pos,
                        page_data.len() - self.data_pos,
                    ));
                }
            }

            other => {
                return Err(crate::Error::UnsupportedSchema(format!(
                    "unsupported data page encoding {other} in column '{}'",
                    self.node.name,
                )));
            }
        }

        // Drop a filter that is not filtering
        if self.filter.is_some()
            && self.rows_returned > FILTER_EVAL_MIN_ROWS
            && (self.filter_rows_rejected as f64)
                < self.rows_returned as f64 * FILTER_MIN_REJECT_RATIO
        {
            log::debug!(
                "disabling runtime filter on column '{}' ({} of {} rows rejected)",
                self.node.name,
                self.filter_rows_rejected,
                self.rows_returned,
            );
            self.filter = None;
        }

        Ok(())
    }

    fn read_definition_level(&mut self) -> crate::Result<i32> {
        if self.node.max_def_level == 0 {
            // The column and its ancestors are required; nothing encoded
            return Ok(0);
        }

        let level = self
            .def_decoder
            .as_mut()
            .and_then(LevelDecoder::get)
            .ok_or_else(|| {
                crate::Error::Corrupt(format!(
                    "could not decode definition level in column '{}'",
                    self.node.name,
                ))
            })?;

        let level = i32::from(level);
        if level > self.node.max_def_level {
            return Err(crate::Error::Corrupt(format!(
                "definition level {level} out of range in column '{}'",
                self.node.name,
            )));
        }
        Ok(level)
    }

    fn read_repetition_level(&mut self) -> crate::Result<i32> {
        if self.node.max_rep_level == 0 {
            return Ok(0);
        }

        let level = self
            .rep_decoder
            .as_mut()
            .and_then(LevelDecoder::get)
            .ok_or_else(|| {
                crate::Error::Corrupt(format!(
                    "could not decode repetition level in column '{}'",
                    self.node.name,
                ))
            })?;

        let level = i32::from(level);
        if level > self.node.max_rep_level {
            return Err(crate::Error::Corrupt(format!(
                "repetition level {level} out of range in column '{}'",
                self.node.name,
            )));
        }
        Ok(level)
    }

    pub fn next_levels(&mut self) -> crate::Result<()> {
        if self.num_buffered_values == 0 {
            self.read_data_page()?;

            if self.num_buffered_values == 0 {
                // Column is exhausted
                self.rep_level = -1;
                self.def_level = -1;
                self.pos_current_value = -1;
                return Ok(());
            }
        }

        self.num_buffered_values -= 1;

        self.rep_level = self.read_repetition_level()?;
        self.def_level = self.read_definition_level()?;

        // A new parent collection starts here
        if self.rep_level <= self.node.max_rep_level - 1 {
            self.pos_current_value = 0;
        }

        Ok(())
    }

    pub fn read_value(
        &mut self,
        tuple: &mut Tuple,
        conjuncts_passed: &mut bool,
    ) -> crate::Result<()> {
        debug_assert!(self.rep_level >= 0);
        debug_assert!(self.def_level >= 0);
        debug_assert!(
            self.def_level >= self.node.ira_def_level,
            "next_levels() should have been called until a value is ready",
        );

        let Some(slot) = self.slot.clone() else {
            // Counting reader: levels only
            return self.next_levels();
        };

        if self.def_level >= self.node.max_def_level {
            self.read_slot(&slot, tuple, conjuncts_passed)
        } else {
            tuple.set(slot.slot_idx, Value::Null);
            self.next_levels()
        }
    }

    fn read_slot(
        &mut self,
        slot: &SlotInfo,
        tuple: &mut Tuple,
        conjuncts_passed: &mut bool,
    ) -> crate::Result<()> {
        let encoding = self
            .page_header
            .as_ref()
            .and_then(|h| h.data_page_header.as_ref())
            .map(|h| h.encoding)
            .expect("a data page is loaded");

        let mut value = if encoding == Encoding::PlainDictionary {
            self.dict
                .as_mut()
                .ok_or_else(|| {
                    crate::Error::Corrupt("file corrupt: missing dictionary page".into())
                })?
                .get_next()?
        } else if self.node.physical_type == Some(PhysicalType::Boolean) {
            let bit = self
                .bool_reader
                .as_mut()
                .and_then(BitReader::get_bool)
                .ok_or_else(|| {
                    crate::Error::Corrupt(format!(
                        "invalid boolean data in column '{}'",
                        self.node.name,
                    ))
                })?;
            Value::Boolean(bit)
        } else {
            let page_data = self.page_data.clone().expect("a data page is loaded");
            plain::decode_plain_value(
                &page_data,
                &mut self.data_pos,
                &slot.col_type,
                self.node
                    .physical_type
                    .expect("leaf nodes have a physical type"),
                self.fixed_len_size,
            )?
        };

        if self.needs_conversion {
            value = self.convert(value, &slot.col_type);
        }

        self.rows_returned += 1;

        if *conjuncts_passed {
            if let Some(filter) = &self.filter {
                if !filter.find(value_hash(&value)) {
                    *conjuncts_passed = false;
                    self.filter_rows_rejected += 1;
                }
            }
        }

        tuple.set(slot.slot_idx, value);
        self.next_levels()
    }

    fn convert(&self, value: Value, col_type: &ColumnType) -> Value {
        match (col_type, value) {
            (ColumnType::Char(len), Value::String(mut s)) => {
                // Space padded, fixed length
                s.truncate(*len);
                s.resize(*len, b' ');
                Value::String(s)
            }

            (ColumnType::Timestamp, Value::Timestamp(ts)) => {
                if ts.has_date_and_time() {
                    Value::Timestamp(ts.offset_by_seconds(self.config.local_time_offset_secs))
                } else {
                    Value::Timestamp(ts)
                }
            }

            (_, value) => value,
        }
    }
}

fn init_level_decoder(
    encoding: Encoding,
    max_level: i32,
    page: &PageData,
    pos: &mut usize,
    num_buffered_values: i64,
) -> crate::Result<LevelDecoder> {
    match encoding {
        Encoding::Rle => {
            // A 4-byte little-endian byte count precedes the RLE data
            let field = page.get(*pos..*pos + 4).ok_or_else(|| {
                crate::Error::Corrupt("data page too small for its level stream".into())
            })?;
            let num_bytes = i32::from_le_bytes(field.try_into().expect("4 bytes"));
            if num_bytes < 0 {
                return Err(crate::Error::Corrupt(format!(
                    "corrupt RLE level byte count: {num_bytes}",
                )));
            }
            *pos += 4;

            let num_bytes = num_bytes as usize;
            if *pos + num_bytes > page.len() {
                return Err(crate::Error::Corrupt(
                    "data page too small for its level stream".into(),
                ));
            }

            let bit_width = util::ceil_log2(max_level as u64 + 1);
            let decoder = RleDecoder::new(page.clone(), *pos, num_bytes, bit_width);
            *pos += num_bytes;
            Ok(LevelDecoder::Rle(decoder))
        }

        Encoding::BitPacked => {
            let num_bytes = util::bytes_for_bits(num_buffered_values as usize);
            if *pos + num_bytes > page.len() {
                return Err(crate::Error::Corrupt(
                    "data page too small for its level stream".into(),
                ));
            }

            let reader = BitReader::new(page.clone(), *pos, num_bytes);
            *pos += num_bytes;
            Ok(LevelDecoder::BitPacked(reader))
        }

        other => Err(crate::Error::UnsupportedSchema(format!(
            "unsupported level encoding: {other}",
        ))),
    }
}

/// Reader for a collection column; collections are not materialized in
/// the file, so this reader derives its state from its children's levels.
pub(super) struct CollectionReader {
    pub(super) node: NodeInfo,
    pub(super) slot: Option<SlotInfo>,

    /// Item tuple layout; `None` for pure counting
    pub(super) item_desc: Option<TupleDescriptor>,

    pos_slot: Option<usize>,
    pos_current_value: i64,

    rep_level: i32,
    def_level: i32,

    pub(super) children: Vec<ColumnReader>,
}

impl CollectionReader {
    pub fn new(
        node: NodeInfo,
        slot: Option<SlotInfo>,
        item_desc: Option<TupleDescriptor>,
    ) -> Self {
        Self {
            node,
            slot,
            item_desc,
            pos_slot: None,
            pos_current_value: -1,
            rep_level: -1,
            def_level: -1,
            children: vec![],
        }
    }

    /// The repetition level indicating the current value starts a new
    /// collection at this nesting depth.
    fn new_collection_rep_level(&self) -> i32 {
        self.node.max_rep_level - 1
    }

    pub fn next_levels(&mut self) -> crate::Result<()> {
        debug_assert!(!self.children.is_empty());
        debug_assert!(self.rep_level <= self.new_collection_rep_level());

        let ncrl = self.new_collection_rep_level();

        for child in &mut self.children {
            loop {
                child.next_levels()?;
                if child.rep_level() <= ncrl {
                    break;
                }
            }
        }

        self.update_derived_state();
        Ok(())
    }

    pub fn read_value(
        &mut self,
        tuple: &mut Tuple,
        conjuncts_passed: &mut bool,
    ) -> crate::Result<()> {
        debug_assert!(self.rep_level >= 0);
        debug_assert!(self.def_level >= 0);
        debug_assert!(self.def_level >= self.node.ira_def_level);

        let _ = conjuncts_passed;

        let Some(slot) = self.slot.clone() else {
            return self.next_levels();
        };

        if self.def_level >= self.node.max_def_level {
            self.read_slot(slot.slot_idx, tuple)
        } else {
            tuple.set(slot.slot_idx, Value::Null);
            self.next_levels()
        }
    }

    fn read_slot(&mut self, slot_idx: usize, tuple: &mut Tuple) -> crate::Result<()> {
        debug_assert!(!self.children.is_empty());
        debug_assert!(self.rep_level <= self.new_collection_rep_level());

        let item_desc = self
            .item_desc
            .clone()
            .expect("materializing collections carry the item layout");

        let collection_rep_level = self.new_collection_rep_level();
        let value = assemble_collection(&item_desc, &mut self.children, collection_rep_level)?;

        tuple.set(slot_idx, Value::Collection(value));

        // Assembly advanced the children already
        self.update_derived_state();
        Ok(())
    }

    /// Mirrors the children's position into this reader.
    fn update_derived_state(&mut self) {
        let first = self.children.first().expect("children is non-empty");

        // Levels are not capped at this node's maximum: the comparison
        // against max_def_level is what detects a defined collection
        self.def_level = first.def_level();
        self.rep_level = first.rep_level();

        debug_assert!(self
            .children
            .iter()
            .all(|c| c.rep_level() == self.rep_level));

        if self.rep_level == -1 {
            // No more values
            self.pos_current_value = -1;
        } else if self.rep_level <= self.node.max_rep_level - 2 {
            // Start of a new parent collection
            self.pos_current_value = 0;
        }
    }
}
