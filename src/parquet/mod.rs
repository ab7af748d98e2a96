// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Parquet row-group decoding: footer and schema resolution, column
//! reader construction, page decoding and nested row assembly.

pub mod format;

mod column;
mod dict;
mod footer;
mod levels;
mod plain;
mod schema;

pub use schema::SchemaNode;

use column::{
    read_row, visit_scalars_mut, ColumnReader, NodeInfo, PageStream, ReaderConfig, ScalarReader,
    SlotInfo,
};
use format::{
    ColumnMetaData, FileVersion, PhysicalType, DEFAULT_FOOTER_SIZE, MAX_DICT_HEADER_SIZE,
    PARQUET_CURRENT_VERSION,
};
use schema::resolve_path;

use crate::{
    filter::BlockBloomFilter,
    io::{IoContext, IoManager},
    row::{
        eval_conjuncts, ColumnType, ExprCtx, Row, RowBatch, SchemaPath, TableDescriptor, Tuple,
        TupleDescriptor, DEFAULT_BATCH_SIZE,
    },
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Per-scan configuration
pub struct ParquetReaderOptions {
    /// Bytes prefetched from the end of the file for the footer
    pub footer_size: u64,

    /// Capacity of the internal assembly batches
    pub batch_size: usize,

    /// Whether schema-compatibility warnings abort the scan
    pub abort_on_error: bool,

    /// Adjust TIMESTAMPs written by parquet-mr (Hive) from UTC to local
    /// time
    pub convert_legacy_hive_parquet_utc_timestamps: bool,

    /// Offset applied by the legacy timestamp conversion
    pub local_time_offset_secs: i64,

    /// Runtime Bloom filters by top-level slot index
    pub bloom_filters: Vec<(usize, Arc<BlockBloomFilter>)>,

    /// Scan conjuncts evaluated on assembled rows
    pub conjuncts: Vec<Box<dyn ExprCtx>>,
}

impl Default for ParquetReaderOptions {
    fn default() -> Self {
        Self {
            footer_size: DEFAULT_FOOTER_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            abort_on_error: true,
            convert_legacy_hive_parquet_utc_timestamps: false,
            local_time_offset_secs: 0,
            bloom_filters: vec![],
            conjuncts: vec![],
        }
    }
}

impl std::fmt::Debug for ParquetReaderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ParquetReaderOptions(footer_size={}, batch_size={}, abort_on_error={})",
            self.footer_size, self.batch_size, self.abort_on_error,
        )
    }
}

/// Decodes one Parquet file's row groups into rows shaped by a tuple
/// descriptor.
pub struct ParquetFileReader {
    io: Arc<IoManager>,
    ctx: IoContext,
    path: PathBuf,
    file_len: u64,

    options: ParquetReaderOptions,

    table: TableDescriptor,
    tuple_desc: TupleDescriptor,

    metadata: format::FileMetaData,
    file_version: FileVersion,
    schema: SchemaNode,

    readers: Vec<ColumnReader>,
}

impl std::fmt::Debug for ParquetFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ParquetFileReader({:?}, {} row groups, {} rows)",
            self.path,
            self.metadata.row_groups.len(),
            self.metadata.num_rows,
        )
    }
}

impl ParquetFileReader {
    /// Opens a file: reads the footer, reconstructs the schema tree and
    /// builds the column reader tree for `tuple_desc`.
    pub fn open(
        io: &Arc<IoManager>,
        path: &Path,
        table: TableDescriptor,
        tuple_desc: TupleDescriptor,
        options: ParquetReaderOptions,
    ) -> crate::Result<Self> {
        let ctx = io.register_context();
        let file_len = std::fs::metadata(path)?.len();

        let metadata =
            footer::read_file_metadata(io, &ctx, path, file_len, options.footer_size)?;

        if metadata.version > PARQUET_CURRENT_VERSION {
            return Err(crate::Error::UnsupportedSchema(format!(
                "file {path:?} is of an unsupported version: {}",
                metadata.version,
            )));
        }

        let file_version = metadata
            .created_by
            .as_deref()
            .map(FileVersion::parse)
            .unwrap_or_default();

        let schema = schema::create_schema_tree(&metadata.schema)?;

        if metadata.row_groups.is_empty() && metadata.num_rows > 0 {
            return Err(crate::Error::Corrupt(format!(
                "invalid file: {path:?} has no row groups",
            )));
        }

        let mut reader = Self {
            io: io.clone(),
            ctx,
            path: path.into(),
            file_len,
            options,
            table,
            tuple_desc,
            metadata,
            file_version,
            schema,
            readers: vec![],
        };

        // A projection with no materialized slots is served from the
        // footer alone; no readers, no column chunks
        if !reader.tuple_desc.slots.is_empty() {
            let config = reader.reader_config();
            reader.readers =
                reader.create_column_readers(&reader.tuple_desc.clone(), &vec![], &config, true)?;
        }

        Ok(reader)
    }

    #[must_use]
    pub fn num_rows(&self) -> i64 {
        self.metadata.num_rows
    }

    #[must_use]
    pub fn num_row_groups(&self) -> usize {
        self.metadata.row_groups.len()
    }

    #[must_use]
    pub fn file_version(&self) -> &FileVersion {
        &self.file_version
    }

    fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            file_version: self.file_version.clone(),
            convert_legacy_hive_parquet_utc_timestamps: self
                .options
                .convert_legacy_hive_parquet_utc_timestamps,
            local_time_offset_secs: self.options.local_time_offset_secs,
        }
    }

    /// Builds the reader tree for one tuple descriptor; `top_level`
    /// enables partition-key skipping and runtime filters.
    fn create_column_readers(
        &self,
        tuple_desc: &TupleDescriptor,
        tuple_path: &SchemaPath,
        config: &ReaderConfig,
        top_level: bool,
    ) -> crate::Result<Vec<ColumnReader>> {
        let mut readers = vec![];

        // Each tuple can have at most one position slot; it is attached
        // to the first reader once all slots are processed
        let mut pos_slot: Option<usize> = None;

        for (slot_idx, slot) in tuple_desc.slots.iter().enumerate() {
            if top_level
                && slot
                    .col_path
                    .first()
                    .is_some_and(|&idx| idx < self.table.num_partition_keys)
            {
                continue;
            }

            let resolved = resolve_path(&self.schema, &self.table, &slot.col_path)?;

            if resolved.missing_field {
                // Selecting a column not present in this file; the slot
                // stays NULL in every output tuple
                log::debug!(
                    "file {:?} does not contain path {:?}; slot will be NULL",
                    self.path,
                    slot.col_path,
                );
                continue;
            }

            if resolved.pos_field {
                debug_assert!(
                    pos_slot.is_none(),
                    "only one position slot per tuple",
                );
                pos_slot = Some(slot_idx);
                continue;
            }

            let node = resolved.node.expect("resolved to a node");
            let slot_info = SlotInfo {
                slot_idx,
                col_type: slot.col_type.clone(),
            };

            let reader = if node.is_repeated() {
                let item_desc = slot
                    .item_desc
                    .as_deref()
                    .cloned()
                    .expect("collection slots carry their item layout");

                let mut collection = column::CollectionReader::new(
                    NodeInfo::from(node),
                    Some(slot_info),
                    Some(item_desc.clone()),
                );
                collection.children =
                    self.create_column_readers(&item_desc, &slot.col_path, config, false)?;

                ColumnReader::Collection(collection)
            } else {
                let filter = top_level
                    .then(|| {
                        self.options
                            .bloom_filters
                            .iter()
                            .find(|(idx, _)| *idx == slot_idx)
                            .map(|(_, f)| f.clone())
                    })
                    .flatten();

                ColumnReader::Scalar(ScalarReader::new(
                    NodeInfo::from(node),
                    Some(slot_info),
                    config.clone(),
                    filter,
                ))
            };

            readers.push(reader);
        }

        if readers.is_empty() {
            // count(*) over a collection, or no materialized column exists
            // in this file: a single reader drives the levels so rows can
            // still be enumerated
            readers.push(self.create_counting_reader(tuple_path, config)?);
        }

        if let Some(pos_slot) = pos_slot {
            readers
                .first_mut()
                .expect("a reader exists by now")
                .set_pos_slot(pos_slot);
        }

        Ok(readers)
    }

    /// Creates a reader that only drives def/rep levels, targeting the
    /// least-nested scalar descendant of `parent_path`.
    fn create_counting_reader(
        &self,
        parent_path: &SchemaPath,
        config: &ReaderConfig,
    ) -> crate::Result<ColumnReader> {
        let resolved = resolve_path(&self.schema, &self.table, parent_path)?;

        if resolved.missing_field {
            return Err(crate::Error::UnsupportedSchema(format!(
                "could not find path {parent_path:?} in file {:?}",
                self.path,
            )));
        }

        let parent_node = resolved.node.expect("resolved to a node");
        debug_assert!(!resolved.pos_field);
        debug_assert!(!parent_node.children.is_empty());
        debug_assert!(parent_path.is_empty() || parent_node.is_repeated());

        // Find a non-struct child to drive on
        let mut target = parent_node.children.first().expect("has children");
        while !target.children.is_empty() && !target.is_repeated() {
            target = target.children.first().expect("non-empty");
        }

        if !target.is_repeated() {
            return Ok(ColumnReader::Scalar(ScalarReader::new(
                NodeInfo::from(target),
                None,
                config.clone(),
                None,
            )));
        }

        // The target is itself a collection: drive it through its closest
        // scalar descendant (breadth-first, i.e. least nested, as a proxy
        // for fewest values)
        let mut queue = std::collections::VecDeque::from([target]);
        let mut scalar_node = target;
        while let Some(node) = queue.pop_front() {
            if node.children.is_empty() {
                scalar_node = node;
                break;
            }
            queue.extend(node.children.iter());
        }
        debug_assert!(scalar_node.children.is_empty());

        let mut collection =
            column::CollectionReader::new(NodeInfo::from(target), None, None);
        collection.children.push(ColumnReader::Scalar(ScalarReader::new(
            NodeInfo::from(scalar_node),
            None,
            config.clone(),
            None,
        )));

        Ok(ColumnReader::Collection(collection))
    }

    /// Prepares every scalar reader for `row_group_idx`: validates the
    /// column chunks and loads their byte ranges.
    fn init_columns(&mut self, row_group_idx: usize) -> crate::Result<()> {
        let mut readers = std::mem::take(&mut self.readers);
        let result = self.init_columns_for(&mut readers, row_group_idx);
        self.readers = readers;
        result
    }

    /// Initializes one nesting level of readers; value counts must agree
    /// among the scalars of a level (not across levels, where repetition
    /// legitimately changes them).
    fn init_columns_for(
        &self,
        readers: &mut [ColumnReader],
        row_group_idx: usize,
    ) -> crate::Result<()> {
        let row_group = self
            .metadata
            .row_groups
            .get(row_group_idx)
            .expect("row group index is valid")
            .clone();

        let abort_on_error = self.options.abort_on_error;
        let file_version = self.file_version.clone();
        let file_len = self.file_len;
        let path = self.path.clone();
        let io = self.io.clone();
        let ctx = self.ctx.clone();

        let mut num_values: Option<i64> = None;

        for reader in readers {
            let scalar = match reader {
                ColumnReader::Collection(collection) => {
                    self.init_columns_for(&mut collection.children, row_group_idx)?;
                    continue;
                }
                ColumnReader::Scalar(scalar) => scalar,
            };

            let col_chunk = row_group.columns.get(scalar.col_idx()).ok_or_else(|| {
                crate::Error::Corrupt(format!(
                    "row group {row_group_idx} is missing column chunk {}",
                    scalar.col_idx(),
                ))
            })?;
            let meta = &col_chunk.meta_data;

            match num_values {
                None => num_values = Some(meta.num_values),
                Some(expected) => {
                    if meta.num_values != expected {
                        return Err(crate::Error::Corrupt(format!(
                            "column {} has {} values but other columns have {expected}",
                            scalar.col_idx(),
                            meta.num_values,
                        )));
                    }
                }
            }

            validate_column(scalar, meta, abort_on_error)?;

            let mut col_start = meta.data_page_offset;

            // The dictionary page, if any, must precede the data pages;
            // the chunk read starts there
            if let Some(dict_offset) = meta.dictionary_page_offset {
                if dict_offset >= col_start {
                    return Err(crate::Error::Corrupt(format!(
                        "metadata is corrupt: dictionary page (offset={dict_offset}) must come \
                         before any data pages (offset={col_start})",
                    )));
                }
                col_start = dict_offset;
            }

            let mut col_len = meta.total_compressed_size;
            let col_end = col_start + col_len;

            if col_end <= 0 || col_end as u64 > file_len {
                return Err(crate::Error::Corrupt(format!(
                    "metadata is corrupt: column {} has invalid column offsets \
                     (offset={col_start}, size={col_len}, file_size={file_len})",
                    scalar.col_idx(),
                )));
            }

            if file_version.application == "parquet-mr" && file_version.lt(1, 2, 9) {
                // Early parquet-mr did not include the dictionary page
                // header in total_compressed_size; pad to compensate
                let bytes_remaining = file_len - col_end as u64;
                col_len += MAX_DICT_HEADER_SIZE.min(bytes_remaining) as i64;
            }

            if col_chunk.file_path.is_some() {
                return Err(crate::Error::UnsupportedSchema(
                    "column chunks in separate files are not supported".into(),
                ));
            }

            let bytes = io.read(&ctx, &path, col_start as u64, col_len as usize)?;
            scalar.reset(meta, PageStream::new(bytes))?;
        }

        Ok(())
    }

    /// Decodes one row group, appending the surviving rows to `out`.
    pub fn read_row_group(&mut self, row_group_idx: usize, out: &mut Vec<Row>) -> crate::Result<()> {
        debug_assert!(
            !self.tuple_desc.slots.is_empty(),
            "metadata-only scans never touch row groups",
        );

        self.init_columns(row_group_idx)?;

        // Prime every reader with its first levels
        for reader in &mut self.readers {
            reader.next_levels()?;
        }

        let in_collection = self
            .readers
            .first()
            .expect("readers exist for non-empty projections")
            .ira_def_level()
            > 0;

        let mut batch = RowBatch::new(self.options.batch_size);
        let mut rows_read: i64 = 0;

        let mut end_of_group = self.readers.first().expect("non-empty").rep_level() == -1;

        while !end_of_group {
            let first = self.readers.first().expect("non-empty");

            // A tuple is produced iff the collection containing its values
            // is non-empty and non-NULL
            let materialize_tuple =
                !in_collection || first.def_level() >= first.ira_def_level();

            let mut tuple = Tuple::null_of(&self.tuple_desc);
            let mut conjuncts_passed = true;

            read_row(
                &mut self.readers,
                &mut tuple,
                materialize_tuple,
                in_collection,
                &mut conjuncts_passed,
            )?;
            rows_read += 1;

            end_of_group = self.readers.first().expect("non-empty").rep_level() == -1;

            if materialize_tuple && conjuncts_passed {
                let row = Row::single(tuple);
                if eval_conjuncts(&self.options.conjuncts, &row) {
                    batch.add_row(row);
                    batch.commit_rows(1);
                }
            }

            if batch.at_capacity() {
                out.extend(batch.take_rows());
            }
        }

        out.extend(batch.take_rows());

        self.validate_end_of_row_group(row_group_idx, rows_read)
    }

    /// Decodes the whole file.
    pub fn read_all(&mut self) -> crate::Result<Vec<Row>> {
        if self.tuple_desc.slots.is_empty() {
            // Metadata-only: emit one empty tuple per declared row
            let num_rows = usize::try_from(self.metadata.num_rows).unwrap_or(0);
            return Ok((0..num_rows)
                .map(|_| Row::single(Tuple::default()))
                .collect());
        }

        let mut out = vec![];
        for row_group_idx in 0..self.metadata.row_groups.len() {
            self.read_row_group(row_group_idx, &mut out)?;
        }

        self.close();
        Ok(out)
    }

    /// Releases per-column resources.
    pub fn close(&mut self) {
        let _ = visit_scalars_mut(&mut self.readers, &mut |scalar| {
            scalar.close();
            Ok(())
        });
    }

    fn validate_end_of_row_group(
        &mut self,
        row_group_idx: usize,
        rows_read: i64,
    ) -> crate::Result<()> {
        let first_max_rep = self
            .readers
            .first()
            .expect("readers exist")
            .max_rep_level();

        if first_max_rep == 0 {
            // Table-level readers: the row count is exact
            let expected = self
                .metadata
                .row_groups
                .get(row_group_idx)
                .map(|g| g.num_rows)
                .unwrap_or(0);

            if rows_read != expected {
                return Err(crate::Error::Corrupt(format!(
                    "row group {row_group_idx} declared {expected} rows but {rows_read} were read",
                )));
            }
        }

        visit_scalars_mut(&mut self.readers, &mut |scalar| {
            // A reader with leftover buffered values means some column had
            // more values than its metadata declared
            if scalar.num_buffered_values != 0 {
                return Err(crate::Error::Corrupt(format!(
                    "column {} has unread values in its final data page",
                    scalar.col_idx(),
                )));
            }

            let declared = scalar
                .metadata
                .as_ref()
                .map(|m| m.num_values)
                .unwrap_or(0);
            if scalar.num_values_read != declared {
                return Err(crate::Error::Corrupt(format!(
                    "column {} read {} values but its metadata declared {declared}",
                    scalar.col_idx(),
                    scalar.num_values_read,
                )));
            }

            Ok(())
        })
    }
}

/// Reads the footers of a batch of files up front.
///
/// The scan side calls this once per file set before per-file readers are
/// built, so footer I/O is issued in one burst; split bookkeeping (reading
/// a file only for its first split) belongs to the scheduler driving this.
pub fn read_footers(
    io: &Arc<IoManager>,
    paths: &[PathBuf],
    footer_size: u64,
) -> crate::Result<Vec<format::FileMetaData>> {
    let ctx = io.register_context();

    let mut footers = Vec::with_capacity(paths.len());
    for path in paths {
        let file_len = std::fs::metadata(path)?.len();
        footers.push(footer::read_file_metadata(
            io,
            &ctx,
            path,
            file_len,
            footer_size,
        )?);
    }

    Ok(footers)
}

/// Per-column metadata validation against the slot's declared type.
fn validate_column(
    scalar: &ScalarReader,
    meta: &ColumnMetaData,
    abort_on_error: bool,
) -> crate::Result<()> {
    let node = &scalar.node;

    for encoding in &meta.encodings {
        if !encoding.is_supported() {
            return Err(crate::Error::UnsupportedSchema(format!(
                "column '{}' uses an unsupported encoding: {encoding}",
                node.name,
            )));
        }
    }

    if !meta.codec.is_supported() {
        return Err(crate::Error::UnsupportedSchema(format!(
            "column '{}' uses an unsupported compression: {}",
            node.name, meta.codec,
        )));
    }

    if node.repetition == format::Repetition::Repeated {
        return Err(crate::Error::UnsupportedSchema(format!(
            "column '{}' contains an unsupported column repetition type",
            node.name,
        )));
    }

    // Everything below only applies when values are materialized
    let Some(slot) = &scalar.slot else {
        return Ok(());
    };

    let log_or_fail = |message: String| -> crate::Result<()> {
        if abort_on_error {
            Err(crate::Error::UnsupportedSchema(message))
        } else {
            log::warn!("{message}");
            Ok(())
        }
    };

    let expected_type = expected_physical_type(&slot.col_type);
    if expected_type != meta.physical_type {
        return Err(crate::Error::UnsupportedSchema(format!(
            "column '{}' has an incompatible type: expected {expected_type:?}, found {:?}",
            node.name, meta.physical_type,
        )));
    }

    let is_converted_type_decimal = node.converted_type == Some(format::ConvertedType::Decimal);

    if let ColumnType::Decimal { precision, scale } = &slot.col_type {
        // The scale and byte length are load bearing; reject mismatches
        if meta.physical_type != PhysicalType::FixedLenByteArray {
            return Err(crate::Error::UnsupportedSchema(format!(
                "column '{}' should be a decimal column encoded using FIXED_LEN_BYTE_ARRAY",
                node.name,
            )));
        }

        let expected_len = ColumnType::decimal_byte_size(*precision) as u32;
        match node.type_length {
            None => {
                return Err(crate::Error::UnsupportedSchema(format!(
                    "column '{}' does not have type_length set",
                    node.name,
                )));
            }
            Some(len) if len != expected_len => {
                return Err(crate::Error::UnsupportedSchema(format!(
                    "column '{}' has an invalid type length: expected {expected_len}, found {len}",
                    node.name,
                )));
            }
            Some(_) => {}
        }

        match node.scale {
            None => {
                return Err(crate::Error::UnsupportedSchema(format!(
                    "column '{}' does not have the scale set",
                    node.name,
                )));
            }
            Some(file_scale) if file_scale != u32::from(*scale) => {
                return Err(crate::Error::UnsupportedSchema(format!(
                    "column '{}' has a scale that does not match the table metadata: \
                     file {file_scale}, table {scale}",
                    node.name,
                )));
            }
            Some(_) => {}
        }

        // Precision and the converted-type annotation are advisory
        match node.precision {
            None => log_or_fail(format!(
                "column '{}' is missing its precision",
                node.name,
            ))?,
            Some(file_precision) if file_precision != u32::from(*precision) => {
                log_or_fail(format!(
                    "column '{}' has the wrong precision: file {file_precision}, table {precision}",
                    node.name,
                ))?;
            }
            Some(_) => {}
        }

        if !is_converted_type_decimal {
            log_or_fail(format!(
                "column '{}' is not annotated with the DECIMAL converted type",
                node.name,
            ))?;
        }
    } else if node.scale.is_some() || node.precision.is_some() || is_converted_type_decimal {
        log_or_fail(format!(
            "column '{}' carries decimal metadata incompatible with its type",
            node.name,
        ))?;
    }

    Ok(())
}

fn expected_physical_type(col_type: &ColumnType) -> PhysicalType {
    match col_type {
        ColumnType::Boolean => PhysicalType::Boolean,
        ColumnType::TinyInt | ColumnType::SmallInt | ColumnType::Int => PhysicalType::Int32,
        ColumnType::BigInt => PhysicalType::Int64,
        ColumnType::Float => PhysicalType::Float,
        ColumnType::Double => PhysicalType::Double,
        ColumnType::Timestamp => PhysicalType::Int96,
        ColumnType::String | ColumnType::Varchar(_) | ColumnType::Char(_) => {
            PhysicalType::ByteArray
        }
        ColumnType::Decimal { .. } => PhysicalType::FixedLenByteArray,
        ColumnType::Array(_) | ColumnType::Map(_, _) | ColumnType::Struct(_) => {
            unreachable!("collections are not validated as scalar columns")
        }
    }
}
